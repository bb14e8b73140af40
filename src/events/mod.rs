//! Lifecycle events and event handling.
//!
//! This module provides event emission for job firing lifecycle,
//! enabling observability into scheduling decisions without coupling
//! the engine to any particular sink.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::types::JobId;

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job's timer fired and a dispatch is starting.
    JobFired { job_id: JobId, timestamp: Instant },

    /// A dispatch finished (successfully or not).
    DispatchCompleted {
        job_id: JobId,
        success: bool,
        status: Option<u16>,
        duration: Duration,
        timestamp: Instant,
    },

    /// A one-off job completed successfully and was hard-deleted.
    JobRetired { job_id: JobId, timestamp: Instant },

    /// A job was marked terminally failed.
    JobMarkedFailed { job_id: JobId, timestamp: Instant },

    /// A job's timer was dropped because its next tick left the horizon;
    /// the store still owns the job.
    JobEvicted {
        job_id: JobId,
        next_tick: i64,
        timestamp: Instant,
    },

    /// A firing was refused because the process is draining.
    FireDeferred { job_id: JobId, timestamp: Instant },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobFired { timestamp, .. } => *timestamp,
            Event::DispatchCompleted { timestamp, .. } => *timestamp,
            Event::JobRetired { timestamp, .. } => *timestamp,
            Event::JobMarkedFailed { timestamp, .. } => *timestamp,
            Event::JobEvicted { timestamp, .. } => *timestamp,
            Event::FireDeferred { timestamp, .. } => *timestamp,
        }
    }

    /// Create a JobFired event.
    pub fn fired(job_id: JobId) -> Self {
        Event::JobFired {
            job_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a DispatchCompleted event.
    pub fn dispatch_completed(
        job_id: JobId,
        success: bool,
        status: Option<u16>,
        duration: Duration,
    ) -> Self {
        Event::DispatchCompleted {
            job_id,
            success,
            status,
            duration,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobRetired event.
    pub fn retired(job_id: JobId) -> Self {
        Event::JobRetired {
            job_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobMarkedFailed event.
    pub fn marked_failed(job_id: JobId) -> Self {
        Event::JobMarkedFailed {
            job_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a JobEvicted event.
    pub fn evicted(job_id: JobId, next_tick: i64) -> Self {
        Event::JobEvicted {
            job_id,
            next_tick,
            timestamp: Instant::now(),
        }
    }

    /// Create a FireDeferred event.
    pub fn deferred(job_id: JobId) -> Self {
        Event::FireDeferred {
            job_id,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
