//! Handle for controlling a running scheduler.
//!
//! The handle talks to the engine loop over a command channel; each
//! command carries a oneshot sender for its reply. Handles are cheap to
//! clone and safe to share with the API layer.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::SchedulerError;
use crate::core::types::JobId;
use crate::storage::JobRecord;

/// Commands accepted by the engine loop.
pub(crate) enum SchedulerCommand {
    /// Arm (or replace) the timer for a job; fires immediately if due.
    Schedule {
        job: JobRecord,
        response: oneshot::Sender<()>,
    },
    /// Drop the live timer for a job without touching the store.
    Cancel {
        id: JobId,
        response: oneshot::Sender<()>,
    },
    /// Read operational counters.
    Status {
        response: oneshot::Sender<SchedulerStatus>,
    },
    /// Drain in-flight dispatches and stop the engine.
    Shutdown {
        response: oneshot::Sender<ShutdownReport>,
    },
}

/// Operational counters for health reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStatus {
    /// Number of live timers currently armed.
    pub armed: usize,
    /// Number of dispatches currently executing.
    pub in_flight: usize,
    /// Whether the process is draining.
    pub draining: bool,
    /// Firings refused since draining began.
    pub deferred: u64,
}

/// Terminal report of a drain.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Whether all in-flight dispatches finished before the timeout.
    pub success: bool,
    /// In-flight count observed when the shutdown signal arrived.
    pub waited: usize,
    /// Firings refused during the drain.
    pub deferred: u64,
    /// Jobs still mid-dispatch when the timeout expired.
    pub outstanding: Vec<JobId>,
}

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { command_tx }
    }

    /// Send a command and wait for its reply.
    async fn send<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &'static str,
    ) -> Result<T, SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| SchedulerError::ChannelClosed(operation))?;

        response_rx
            .await
            .map_err(|_| SchedulerError::ChannelClosed(operation))
    }

    /// Arm or replace the schedule for a job. A job whose `next_tick` is
    /// already due fires once before this call returns.
    pub async fn schedule(&self, job: JobRecord) -> Result<(), SchedulerError> {
        self.send(
            |response| SchedulerCommand::Schedule { job, response },
            "schedule",
        )
        .await
    }

    /// Cancel the live timer for a job, if any. The stored record is not
    /// touched.
    pub async fn cancel(&self, id: JobId) -> Result<(), SchedulerError> {
        self.send(|response| SchedulerCommand::Cancel { id, response }, "cancel")
            .await
    }

    /// Read operational counters.
    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        self.send(|response| SchedulerCommand::Status { response }, "status")
            .await
    }

    /// Drain in-flight dispatches and stop the engine, returning the
    /// terminal report. Bounded by the configured drain timeout.
    pub async fn shutdown(&self) -> Result<ShutdownReport, SchedulerError> {
        self.send(|response| SchedulerCommand::Shutdown { response }, "shutdown")
            .await
    }
}
