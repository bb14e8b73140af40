//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{FailureRecord, JobPatch, JobRecord, Storage, StorageError};
use crate::core::types::{FailureId, JobId, UserId};

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    failures: RwLock<HashMap<FailureId, FailureRecord>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_job(&self, job: JobRecord) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| &j.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.next_tick);
        Ok(result.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_jobs(&self, user_id: &UserId) -> Result<usize, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(jobs.values().filter(|j| &j.user_id == user_id).count())
    }

    async fn update_job(&self, id: &JobId, patch: JobPatch) -> Result<JobRecord, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        patch.apply(job);
        Ok(job.clone())
    }

    async fn delete_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        jobs.remove(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn find_due(&self, horizon_ms: i64) -> Result<Vec<JobRecord>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| !j.failed && j.next_tick <= horizon_ms)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.next_tick);
        Ok(result)
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<(), StorageError> {
        let mut failures = self
            .failures
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if failures.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey(format!("failure: {}", record.id)));
        }
        failures.insert(record.id.clone(), record);
        Ok(())
    }

    async fn list_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FailureRecord>, StorageError> {
        let failures = self
            .failures
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = failures
            .values()
            .filter(|f| &f.user_id == user_id && &f.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by_key(|f| f.created_at);
        Ok(result.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
    ) -> Result<usize, StorageError> {
        let failures = self
            .failures
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(failures
            .values()
            .filter(|f| &f.user_id == user_id && &f.job_id == job_id)
            .count())
    }
}
