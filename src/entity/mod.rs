//! Entities of the central store. Shared by every edge device; written only
//! through the identity resolver and the reading insert path.

pub mod devices;
pub mod readings;
pub mod sensors;
