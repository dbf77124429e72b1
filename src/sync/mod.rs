//! The dispatcher: drains the local queue into the central store.

pub mod backoff;
pub mod identity;
pub mod scheduler;
pub mod worker;

pub use backoff::{Backoff, BackoffPolicy};
pub use identity::{IdentityCache, IdentityResolver, SensorKey};
pub use worker::{CycleOutcome, CycleReport, DispatchSettings, Dispatcher};
