//! Graceful shutdown integration tests.
//!
//! Verify that draining waits for in-flight dispatches, refuses new
//! firings, and never blocks past the configured timeout.

use chime::{HttpDispatcher, InMemoryStorage, JobRecord, Scheduler, Storage};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::common::spawn_receiver;

fn one_off_in(url: &str, from_now: ChronoDuration) -> JobRecord {
    let at = Utc::now() + from_now;
    JobRecord::new("user-1", at.to_rfc3339(), "UTC", url)
        .with_next_tick(at.timestamp_millis())
}

async fn start_engine(
    storage: Arc<InMemoryStorage>,
    drain_timeout: Duration,
) -> (chime::SchedulerHandle, tokio::task::JoinHandle<()>) {
    let dispatcher = Arc::new(HttpDispatcher::with_timeout(
        Arc::clone(&storage),
        Duration::from_secs(5),
    ));
    Scheduler::new(storage, dispatcher)
        .with_resync_interval(Duration::from_secs(3600))
        .with_drain_timeout(drain_timeout)
        .with_drain_poll_interval(Duration::from_millis(20))
        .start()
        .await
}

/// Three concurrent dispatches started before the signal all complete;
/// the report counts them as waited with nothing deferred.
#[tokio::test]
async fn test_drain_waits_for_three_concurrent_dispatches() {
    let receiver = spawn_receiver(200, Duration::from_millis(400)).await;
    let storage = Arc::new(InMemoryStorage::new());

    for _ in 0..3 {
        let job = one_off_in(
            &format!("{}/hook", receiver.base_url),
            ChronoDuration::milliseconds(100),
        );
        storage.insert_job(job).await.unwrap();
    }

    // The initial resync arms all three timers
    let (handle, task) = start_engine(Arc::clone(&storage), Duration::from_secs(5)).await;

    // All three fire at ~+100ms and sit in their 400ms dispatch
    receiver.wait_for_hits(3, Duration::from_secs(2)).await;

    let shutdown_started = tokio::time::Instant::now();
    let report = handle.shutdown().await.unwrap();
    let _ = task.await;

    assert!(report.success);
    assert_eq!(report.waited, 3);
    assert_eq!(report.deferred, 0);
    assert!(report.outstanding.is_empty());

    // Shutdown actually waited for the slow dispatches to finish
    assert!(
        shutdown_started.elapsed() >= Duration::from_millis(200),
        "drain should have waited for in-flight dispatches"
    );
    assert_eq!(receiver.hit_count().await, 3);
}

/// A firing that arrives after the signal but before the drain
/// completes is deferred and produces no dispatch call.
#[tokio::test]
async fn test_firing_during_drain_is_deferred() {
    let receiver = spawn_receiver(200, Duration::from_millis(400)).await;
    let storage = Arc::new(InMemoryStorage::new());

    // Busy job: fires at +100ms, dispatch takes 400ms
    let busy = one_off_in(
        &format!("{}/hook", receiver.base_url),
        ChronoDuration::milliseconds(100),
    );
    storage.insert_job(busy).await.unwrap();

    // Late job: fires at +300ms, i.e. during the drain
    let late = one_off_in(
        &format!("{}/hook", receiver.base_url),
        ChronoDuration::milliseconds(300),
    );
    let late_id = late.id.clone();
    storage.insert_job(late).await.unwrap();

    let (handle, task) = start_engine(Arc::clone(&storage), Duration::from_secs(5)).await;

    receiver.wait_for_hits(1, Duration::from_secs(2)).await;

    let report = handle.shutdown().await.unwrap();
    let _ = task.await;

    assert!(report.success);
    assert_eq!(report.waited, 1);
    assert_eq!(report.deferred, 1);

    // The deferred firing never reached the target
    assert_eq!(receiver.hit_count().await, 1);

    // The deferred job is untouched in the store: a restart will still
    // find it due
    let stored = storage.get_job(&late_id).await.unwrap();
    assert!(!stored.failed);
}

/// Shutdown with nothing in flight completes immediately.
#[tokio::test]
async fn test_drain_with_no_in_flight_is_fast() {
    let storage = Arc::new(InMemoryStorage::new());
    let (handle, task) = start_engine(storage, Duration::from_secs(5)).await;

    let started = tokio::time::Instant::now();
    let report = handle.shutdown().await.unwrap();
    let _ = task.await;

    assert!(report.success);
    assert_eq!(report.waited, 0);
    assert_eq!(report.deferred, 0);
    assert!(started.elapsed() < Duration::from_millis(200));
}

/// A dispatch that outlives the drain timeout is reported, not waited
/// for indefinitely.
#[tokio::test]
async fn test_drain_timeout_is_bounded() {
    let receiver = spawn_receiver(200, Duration::from_secs(4)).await;
    let storage = Arc::new(InMemoryStorage::new());

    let job = one_off_in(
        &format!("{}/hook", receiver.base_url),
        ChronoDuration::milliseconds(50),
    );
    let id = job.id.clone();
    storage.insert_job(job).await.unwrap();

    let (handle, task) = start_engine(Arc::clone(&storage), Duration::from_millis(300)).await;

    receiver.wait_for_hits(1, Duration::from_secs(2)).await;

    let started = tokio::time::Instant::now();
    let report = handle.shutdown().await.unwrap();
    let _ = task.await;

    assert!(!report.success);
    assert_eq!(report.waited, 1);
    assert_eq!(report.outstanding, vec![id]);

    // Bounded: roughly the drain timeout, nowhere near the 4s dispatch
    assert!(started.elapsed() < Duration::from_secs(2));
}
