//! The bounded-horizon scheduling engine.
//!
//! Decides which persisted jobs are held as live in-memory timers,
//! fires them, and keeps the timer table convergent with the job store.

mod engine;
mod handle;
mod horizon;

pub use engine::Scheduler;
pub use handle::{SchedulerHandle, SchedulerStatus, ShutdownReport};
pub use horizon::HorizonPolicy;

use thiserror::Error;

/// Errors that can occur when talking to the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The engine is no longer running.
    #[error("scheduler is not running (failed to {0})")]
    ChannelClosed(&'static str),
}
