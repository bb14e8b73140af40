//! Scheduler engine implementation.
//!
//! The engine owns the live timer table and the in-flight set. It is
//! responsible for:
//! - Arming, replacing, and retiring per-job timers
//! - Firing dispatches and applying the per-firing store transition
//! - Periodically resyncing the timer table from the job store
//! - Draining in-flight dispatches on shutdown
//!
//! Timers are explicit one-shot sleep tasks: each firing recomputes the
//! next occurrence and arms exactly one new timer, so horizon eviction
//! and replace semantics stay centrally controlled. Cancelling a timer
//! only cancels the pending callback, never a dispatch already underway.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::{SchedulerCommand, SchedulerHandle, SchedulerStatus, ShutdownReport};
use super::horizon::HorizonPolicy;
use crate::core::schedule::is_cron_syntax;
use crate::core::types::JobId;
use crate::dispatch::Dispatcher;
use crate::events::{Event, EventBus};
use crate::storage::{JobPatch, JobRecord, Storage, StorageError};

/// Buffer size for the command channel between handle and engine.
const COMMAND_CHANNEL_BUFFER: usize = 32;

/// How often the resync loop queries the store for due jobs.
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// How long a drain waits for in-flight dispatches before giving up.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(75);

/// How often the drain loop re-checks the in-flight set.
const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A live timer: the pending callback for one job's next tick.
///
/// Cancellation races the sleep; once the sleep has won, the firing runs
/// to completion regardless of later cancellation.
struct LiveTimer {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl LiveTimer {
    fn cancel(&self) {
        self.token.cancel();
    }
}

/// Shared engine state, owned by the run loop and every timer task.
///
/// Spawning work requires an `Arc` of this state, so the operations that
/// arm timers are associated functions over `&Arc<Self>` rather than
/// plain methods.
struct EngineInner<S, D> {
    storage: Arc<S>,
    dispatcher: Arc<D>,
    horizon: HorizonPolicy,
    events: Arc<EventBus>,
    /// Live timer table. At most one entry per job id.
    timers: Mutex<HashMap<JobId, LiveTimer>>,
    /// Jobs currently executing a dispatch.
    in_flight: Mutex<HashSet<JobId>>,
    draining: AtomicBool,
    deferred: AtomicU64,
}

impl<S: Storage + 'static, D: Dispatcher + 'static> EngineInner<S, D> {
    /// Arm a timer for a job, replacing any existing timer for the same
    /// id. A job whose tick is already due fires immediately, before
    /// this call returns; a job outside the horizon is left dormant in
    /// the store.
    async fn arm_or_replace(inner: &Arc<Self>, job: JobRecord) {
        // Stop-old-then-arm-new is atomic per id: no two live timers may
        // coexist for one job.
        {
            let mut timers = inner.timers.lock().await;
            if let Some(old) = timers.remove(&job.id) {
                old.cancel();
            }
        }

        let now = now_ms();
        if job.next_tick <= now {
            // Late tick. Re-entrant firing of a job already mid-dispatch
            // is skipped; the running firing re-arms as needed.
            let mid_dispatch = inner.in_flight.lock().await.contains(&job.id);
            if !mid_dispatch {
                Self::on_fire(inner, job).await;
            }
            return;
        }

        if inner.horizon.within(job.next_tick, now) {
            Self::arm_timer(inner, job).await;
        }
    }

    /// Spawn the one-shot sleep task for a future tick and record it in
    /// the timer table.
    async fn arm_timer(inner: &Arc<Self>, job: JobRecord) {
        let id = job.id.clone();
        let delay = (job.next_tick - now_ms()).max(0) as u64;

        let token = CancellationToken::new();
        let timer_token = token.clone();
        let task_inner = Arc::clone(inner);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = timer_token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    Self::on_fire(&task_inner, job).await;
                }
            }
        });

        debug!(job_id = %id, delay_ms = delay, "Timer armed");

        let mut timers = inner.timers.lock().await;
        if let Some(old) = timers.insert(id, LiveTimer { token, _handle: handle }) {
            old.cancel();
        }
    }

    /// Drop the live timer for a job without touching the store.
    async fn evict(&self, id: &JobId) {
        let mut timers = self.timers.lock().await;
        if let Some(timer) = timers.remove(id) {
            timer.cancel();
        }
    }

    /// The per-firing state transition.
    async fn on_fire(inner: &Arc<Self>, job: JobRecord) {
        let id = job.id.clone();

        if inner.draining.load(Ordering::SeqCst) {
            // Refuse new dispatches while draining. The job is left
            // untouched in the store, so a later resync or restart will
            // still find it due.
            let mid_dispatch = inner.in_flight.lock().await.contains(&id);
            if !mid_dispatch {
                inner.deferred.fetch_add(1, Ordering::SeqCst);
                inner.events.emit(Event::deferred(id.clone())).await;
                debug!(job_id = %id, "Firing deferred: process is draining");
            }
            return;
        }

        {
            let mut in_flight = inner.in_flight.lock().await;
            if !in_flight.insert(id.clone()) {
                // Already mid-dispatch; the running firing re-arms.
                return;
            }
        }

        inner.events.emit(Event::fired(id.clone())).await;

        let outcome = inner.dispatcher.dispatch(&job).await;
        inner
            .events
            .emit(Event::dispatch_completed(
                id.clone(),
                outcome.succeeded,
                outcome.status,
                outcome.duration(),
            ))
            .await;

        let next = job.schedule().next_tick(Utc::now());
        Self::settle(inner, &job, next, outcome.succeeded).await;

        inner.in_flight.lock().await.remove(&id);
    }

    /// Decide the store mutation and timer fate after a dispatch.
    async fn settle(
        inner: &Arc<Self>,
        job: &JobRecord,
        next: Option<DateTime<Utc>>,
        succeeded: bool,
    ) {
        let id = &job.id;

        let Some(next_at) = next else {
            inner.evict(id).await;
            if succeeded {
                // Terminal success of a one-off job: hard delete.
                if let Err(e) = inner.storage.delete_job(id).await {
                    warn!(job_id = %id, error = %e, "Failed to delete completed one-off job");
                }
                inner.events.emit(Event::retired(id.clone())).await;
                info!(job_id = %id, "One-off job completed, retired");
            } else {
                // No further occurrence and the single one failed: keep
                // the record for inspection, never schedule again.
                inner.mark_failed(id).await;
            }
            return;
        };

        let recurring = is_cron_syntax(&job.time);
        if !succeeded && !recurring {
            // A failed one-off is terminal even when a future tick is
            // still computable; it is not retried.
            inner.evict(id).await;
            inner.mark_failed(id).await;
            return;
        }

        let next_ms = next_at.timestamp_millis();
        match inner.storage.update_job(id, JobPatch::advance(next_ms)).await {
            Err(StorageError::NotFound(_)) => {
                // Hard-deleted while dispatching; do not resurrect.
                inner.evict(id).await;
                return;
            }
            Err(e) => {
                // At-least-once: the unadvanced tick may be redelivered
                // after the next resync.
                error!(job_id = %id, error = %e, "Failed to persist next tick");
            }
            Ok(_) => {}
        }

        let now = now_ms();
        if inner.horizon.within(next_ms, now) {
            let mut updated = job.clone();
            updated.next_tick = next_ms;
            Self::arm_timer(inner, updated).await;
        } else {
            inner.evict(id).await;
            inner.events.emit(Event::evicted(id.clone(), next_ms)).await;
            debug!(job_id = %id, next_tick = next_ms, "Next tick beyond horizon, timer evicted");
        }
    }

    async fn mark_failed(&self, id: &JobId) {
        if let Err(e) = self.storage.update_job(id, JobPatch::mark_failed()).await {
            error!(job_id = %id, error = %e, "Failed to mark job terminally failed");
        }
        self.events.emit(Event::marked_failed(id.clone())).await;
        warn!(job_id = %id, "Job marked terminally failed");
    }

    /// One resync pass: promote every stored job due within the horizon
    /// that has no live timer. Idempotent; query failures are retried on
    /// the next interval.
    async fn resync(inner: &Arc<Self>) {
        if inner.draining.load(Ordering::SeqCst) {
            return;
        }

        let horizon = inner.horizon.horizon_ms(now_ms());
        let due = match inner.storage.find_due(horizon).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Resync query failed, retrying next interval");
                return;
            }
        };

        let mut promoted = 0usize;
        for job in due {
            let already_live = inner.timers.lock().await.contains_key(&job.id);
            if already_live {
                continue;
            }
            let mid_dispatch = inner.in_flight.lock().await.contains(&job.id);
            if mid_dispatch {
                continue;
            }
            Self::arm_or_replace(inner, job).await;
            promoted += 1;
        }

        let armed = inner.timers.lock().await.len();
        debug!(armed, promoted, "Resync pass complete");
    }

    async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            armed: self.timers.lock().await.len(),
            in_flight: self.in_flight.lock().await.len(),
            draining: self.draining.load(Ordering::SeqCst),
            deferred: self.deferred.load(Ordering::SeqCst),
        }
    }

    /// Drain: refuse new dispatches, wait for in-flight ones (bounded),
    /// report the outcome. Never blocks indefinitely.
    async fn drain(&self, timeout: Duration, poll: Duration) -> ShutdownReport {
        self.draining.store(true, Ordering::SeqCst);
        let waited = self.in_flight.lock().await.len();
        info!(in_flight = waited, "Draining: waiting for in-flight dispatches");

        let deadline = tokio::time::Instant::now() + timeout;
        let report = loop {
            let outstanding: Vec<JobId> = self.in_flight.lock().await.iter().cloned().collect();

            if outstanding.is_empty() {
                info!(waited, "Drain complete");
                break ShutdownReport {
                    success: true,
                    waited,
                    deferred: self.deferred.load(Ordering::SeqCst),
                    outstanding: Vec::new(),
                };
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    outstanding = outstanding.len(),
                    "Drain timeout exceeded, abandoning in-flight dispatches"
                );
                break ShutdownReport {
                    success: false,
                    waited,
                    deferred: self.deferred.load(Ordering::SeqCst),
                    outstanding,
                };
            }

            tokio::time::sleep(poll).await;
        };

        let mut timers = self.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.cancel();
        }

        report
    }
}

/// The bounded-horizon scheduling engine.
///
/// Owns the in-memory table of live timers keyed by job id. The table is
/// process-local and rebuilt purely from the job store via resync on
/// every start; the store remains the single source of truth.
pub struct Scheduler<S, D> {
    storage: Arc<S>,
    dispatcher: Arc<D>,
    horizon: HorizonPolicy,
    event_bus: Arc<EventBus>,
    resync_interval: Duration,
    drain_timeout: Duration,
    drain_poll_interval: Duration,
}

impl<S: Storage + 'static, D: Dispatcher + 'static> Scheduler<S, D> {
    /// Create a scheduler over the given store and dispatcher.
    pub fn new(storage: Arc<S>, dispatcher: Arc<D>) -> Self {
        Self {
            storage,
            dispatcher,
            horizon: HorizonPolicy::default(),
            event_bus: Arc::new(EventBus::new()),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
        }
    }

    /// Set the horizon window.
    pub fn with_horizon(mut self, window: Duration) -> Self {
        self.horizon = HorizonPolicy::new(window);
        self
    }

    /// Set the resync interval.
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the drain poll interval.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Start the engine and return a handle for controlling it.
    ///
    /// An initial resync pass runs before any command is served,
    /// rebuilding the timer table from the store; this is the sole
    /// restart-recovery mechanism.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);

        let inner = Arc::new(EngineInner {
            storage: self.storage,
            dispatcher: self.dispatcher,
            horizon: self.horizon,
            events: self.event_bus,
            timers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            draining: AtomicBool::new(false),
            deferred: AtomicU64::new(0),
        });

        let handle = SchedulerHandle::new(command_tx);
        let resync_interval = self.resync_interval;
        let drain_timeout = self.drain_timeout;
        let drain_poll_interval = self.drain_poll_interval;

        let task = tokio::spawn(async move {
            run(inner, command_rx, resync_interval, drain_timeout, drain_poll_interval).await;
        });

        (handle, task)
    }
}

/// Engine run loop: one initial resync pass, then resync on an interval,
/// serve commands, and drain on shutdown.
async fn run<S: Storage + 'static, D: Dispatcher + 'static>(
    inner: Arc<EngineInner<S, D>>,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
    resync_interval: Duration,
    drain_timeout: Duration,
    drain_poll_interval: Duration,
) {
    EngineInner::resync(&inner).await;

    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + resync_interval,
        resync_interval,
    );

    loop {
        tokio::select! {
            _ = resync.tick() => {
                EngineInner::resync(&inner).await;
            }

            command = command_rx.recv() => {
                match command {
                    Some(SchedulerCommand::Schedule { job, response }) => {
                        EngineInner::arm_or_replace(&inner, job).await;
                        let _ = response.send(());
                    }
                    Some(SchedulerCommand::Cancel { id, response }) => {
                        inner.evict(&id).await;
                        let _ = response.send(());
                    }
                    Some(SchedulerCommand::Status { response }) => {
                        let _ = response.send(inner.status().await);
                    }
                    Some(SchedulerCommand::Shutdown { response }) => {
                        let report = inner.drain(drain_timeout, drain_poll_interval).await;
                        let _ = response.send(report);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
