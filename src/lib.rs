//! chime - a hosted webhook job scheduler.
//!
//! Clients register time-triggered webhook jobs (one-off or recurring
//! cron); chime fires an HTTP call to the target URL at the computed
//! time, with failure escalation and optional failure audit logging.
//!
//! The core is a bounded-horizon scheduling engine: only jobs due within
//! a rolling near-term window are held as live in-memory timers, while
//! the rest stay dormant in the job store until a periodic resync pass
//! promotes them.

pub mod api;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod scheduler;
pub mod storage;

pub use self::core::schedule::{is_cron_syntax, is_valid_time, is_valid_timezone, Schedule};
pub use self::core::types::{FailureId, JobId, UserId};
pub use dispatch::{DispatchOutcome, Dispatcher, HttpDispatcher, JOB_ID_HEADER};
pub use events::{Event, EventBus, EventHandler};
pub use scheduler::{
    HorizonPolicy, Scheduler, SchedulerError, SchedulerHandle, SchedulerStatus, ShutdownReport,
};
pub use storage::{
    FailureRecord, HttpMethod, InMemoryStorage, JobPatch, JobRecord, SqliteStorage, Storage,
    StorageError,
};
