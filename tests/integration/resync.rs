//! Resync loop integration tests: restart recovery, horizon promotion,
//! and tolerance of store failures.

use async_trait::async_trait;
use chime::{
    FailureRecord, HttpDispatcher, InMemoryStorage, JobId, JobPatch, JobRecord, Scheduler,
    Storage, StorageError, UserId,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn job_in(from_now: ChronoDuration) -> JobRecord {
    let at = Utc::now() + from_now;
    JobRecord::new("user-1", at.to_rfc3339(), "UTC", "http://127.0.0.1:1/hook")
        .with_next_tick(at.timestamp_millis())
}

/// Storage wrapper that can be told to fail `find_due`, for exercising
/// the resync loop's retry behavior.
struct FailingStorage {
    inner: InMemoryStorage,
    fail_find_due: AtomicBool,
}

impl FailingStorage {
    fn new() -> Self {
        Self {
            inner: InMemoryStorage::new(),
            fail_find_due: AtomicBool::new(false),
        }
    }

    fn set_fail_find_due(&self, fail: bool) {
        self.fail_find_due.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for FailingStorage {
    async fn insert_job(&self, job: JobRecord) -> Result<(), StorageError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        self.inner.list_jobs(user_id, limit, offset).await
    }

    async fn count_jobs(&self, user_id: &UserId) -> Result<usize, StorageError> {
        self.inner.count_jobs(user_id).await
    }

    async fn update_job(&self, id: &JobId, patch: JobPatch) -> Result<JobRecord, StorageError> {
        self.inner.update_job(id, patch).await
    }

    async fn delete_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        self.inner.delete_job(id).await
    }

    async fn find_due(&self, horizon_ms: i64) -> Result<Vec<JobRecord>, StorageError> {
        if self.fail_find_due.load(Ordering::SeqCst) {
            return Err(StorageError::Other("injected find_due error".into()));
        }
        self.inner.find_due(horizon_ms).await
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<(), StorageError> {
        self.inner.insert_failure(record).await
    }

    async fn list_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FailureRecord>, StorageError> {
        self.inner.list_failures(user_id, job_id, limit, offset).await
    }

    async fn count_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
    ) -> Result<usize, StorageError> {
        self.inner.count_failures(user_id, job_id).await
    }
}

/// On start, one resync pass rebuilds the timer table from the store:
/// near-term jobs are armed, dormant and terminal ones are not.
#[tokio::test]
async fn test_startup_resync_rebuilds_timer_table() {
    let storage = Arc::new(InMemoryStorage::new());

    storage.insert_job(job_in(ChronoDuration::seconds(20))).await.unwrap();
    storage.insert_job(job_in(ChronoDuration::seconds(40))).await.unwrap();
    // Beyond the 60s horizon: stays dormant
    storage.insert_job(job_in(ChronoDuration::minutes(10))).await.unwrap();
    // Terminal: never armed
    let mut dead = job_in(ChronoDuration::seconds(20));
    dead.failed = true;
    storage.insert_job(dead).await.unwrap();

    let dispatcher = Arc::new(HttpDispatcher::new(Arc::clone(&storage)));
    let (handle, task) = Scheduler::new(Arc::clone(&storage), dispatcher)
        .with_horizon(Duration::from_secs(60))
        .with_resync_interval(Duration::from_secs(3600))
        .start()
        .await;

    assert_eq!(handle.status().await.unwrap().armed, 2);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// A dormant job is promoted to a live timer once its tick enters the
/// horizon, within one resync interval.
#[tokio::test]
async fn test_job_promoted_when_it_enters_horizon() {
    let storage = Arc::new(InMemoryStorage::new());

    // 2s out with a 1s horizon: outside at first
    let job = job_in(ChronoDuration::seconds(2));
    storage.insert_job(job).await.unwrap();

    let dispatcher = Arc::new(HttpDispatcher::new(Arc::clone(&storage)));
    let (handle, task) = Scheduler::new(Arc::clone(&storage), dispatcher)
        .with_horizon(Duration::from_secs(1))
        .with_resync_interval(Duration::from_millis(100))
        .start()
        .await;

    assert_eq!(handle.status().await.unwrap().armed, 0);

    // Once ~1s has passed the tick is inside the horizon and a resync
    // pass must promote it
    let start = tokio::time::Instant::now();
    loop {
        if handle.status().await.unwrap().armed == 1 {
            break;
        }
        if start.elapsed() > Duration::from_secs(3) {
            panic!("job was never promoted into the horizon");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// A failing `find_due` query is logged and retried on the next
/// interval; the process neither crashes nor stops resyncing.
#[tokio::test]
async fn test_resync_survives_store_query_failure() {
    let storage = Arc::new(FailingStorage::new());
    storage.set_fail_find_due(true);

    storage
        .insert_job(job_in(ChronoDuration::seconds(30)))
        .await
        .unwrap();

    let dispatcher = Arc::new(HttpDispatcher::new(Arc::clone(&storage)));
    let (handle, task) = Scheduler::new(Arc::clone(&storage), dispatcher)
        .with_resync_interval(Duration::from_millis(100))
        .start()
        .await;

    // Failing passes arm nothing
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handle.status().await.unwrap().armed, 0);

    // Heal the store: the next pass picks the job up
    storage.set_fail_find_due(false);
    let start = tokio::time::Instant::now();
    loop {
        if handle.status().await.unwrap().armed == 1 {
            break;
        }
        if start.elapsed() > Duration::from_secs(3) {
            panic!("resync never recovered after the store healed");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
