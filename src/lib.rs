//! Edge Relay - durable local queue and reliable forwarder for sensor readings
//!
//! This library exposes the core modules for testing and reuse.

pub mod collector;
pub mod config;
pub mod entity;
pub mod error;
pub mod queue;
pub mod remote;
pub mod sync;
