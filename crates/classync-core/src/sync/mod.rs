//! Background synchronization
//!
//! The [`SyncEngine`] runs a single cycle (upload the mutation log, then
//! pull changes). The [`SyncScheduler`] decides when cycles run: on a timer,
//! when connectivity comes back, or on a manual refresh.
//!
//! ## Exclusion
//!
//! Hydration and sync cycles share one [`SyncGate`], so they never overlap
//! and at most one cycle runs at a time.

mod backoff;
mod engine;
mod scheduler;

use std::sync::Arc;

pub use backoff::Backoff;
pub use engine::{CycleReport, EngineSettings, SyncEngine};
pub use scheduler::{SchedulerEvent, SchedulerHandle, SchedulerState, SyncScheduler, Trigger};

/// Mutual exclusion between hydration and sync cycles
pub type SyncGate = Arc<tokio::sync::Mutex<()>>;

pub fn new_gate() -> SyncGate {
    Arc::new(tokio::sync::Mutex::new(()))
}
