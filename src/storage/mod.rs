//! Storage abstraction for persisting jobs and failure audit records.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite). The job store is the single
//! source of truth: the scheduler's in-memory timer table is rebuilt
//! from it on every process start.

mod memory;
mod sqlite;

pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use thiserror::Error;

use crate::core::schedule::Schedule;
use crate::core::types::{FailureId, JobId, UserId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// HTTP method of a job's action call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// The canonical uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether requests with this method carry a body. GET and DELETE
    /// never do.
    pub fn has_body(&self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported method: {}", other)),
        }
    }
}

/// Persisted job definition.
///
/// A job is either active (`failed = false`, meaningful `next_tick`),
/// terminal (`failed = true`, permanently excluded from scheduling), or
/// deleted from the store entirely. There is no paused state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: JobId,
    /// Owner of the job.
    pub user_id: UserId,
    /// Time specification: cron expression or absolute date/time.
    pub time: String,
    /// IANA timezone the specification is evaluated in.
    pub time_zone: String,
    /// Target URL for the action call.
    pub action_url: String,
    /// HTTP method of the action call.
    pub method: HttpMethod,
    /// Extra headers sent with the action call.
    pub headers: HashMap<String, String>,
    /// JSON payload for methods that carry a body.
    pub payload: Option<Value>,
    /// Optional URL notified after a failed dispatch.
    pub failure_url: Option<String>,
    /// Whether failed dispatches are written to the failure audit log.
    pub failure_logging: bool,
    /// Next scheduled firing, epoch milliseconds. Range-indexed.
    pub next_tick: i64,
    /// Terminal flag; once set the job is never scheduled again.
    pub failed: bool,
    /// When the job was created.
    pub created_at: SystemTime,
    /// When the job was last updated.
    pub updated_at: SystemTime,
}

impl JobRecord {
    /// Create a new active job with default method (GET), no headers,
    /// no payload, and no failure policy.
    pub fn new(
        user_id: impl Into<UserId>,
        time: impl Into<String>,
        time_zone: impl Into<String>,
        action_url: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: JobId::new(),
            user_id: user_id.into(),
            time: time.into(),
            time_zone: time_zone.into(),
            action_url: action_url.into(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            payload: None,
            failure_url: None,
            failure_logging: false,
            next_tick: 0,
            failed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the HTTP method.
    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Set the request headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the failure notification URL.
    pub fn with_failure_url(mut self, url: impl Into<String>) -> Self {
        self.failure_url = Some(url.into());
        self
    }

    /// Enable or disable failure audit logging.
    pub fn with_failure_logging(mut self, enabled: bool) -> Self {
        self.failure_logging = enabled;
        self
    }

    /// Set the next scheduled tick (epoch milliseconds).
    pub fn with_next_tick(mut self, next_tick: i64) -> Self {
        self.next_tick = next_tick;
        self
    }

    /// The job's schedule (time specification + timezone).
    pub fn schedule(&self) -> Schedule {
        Schedule::new(self.time.clone(), self.time_zone.clone())
    }
}

/// Partial update applied to a stored job. Unset fields are left
/// untouched; `updated_at` is refreshed on every apply.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub action_url: Option<String>,
    pub failure_url: Option<String>,
    pub failure_logging: Option<bool>,
    pub method: Option<HttpMethod>,
    pub headers: Option<HashMap<String, String>>,
    pub payload: Option<Value>,
    pub time: Option<String>,
    pub time_zone: Option<String>,
    pub next_tick: Option<i64>,
    pub failed: Option<bool>,
}

impl JobPatch {
    /// A patch that only advances `next_tick`.
    pub fn advance(next_tick: i64) -> Self {
        Self {
            next_tick: Some(next_tick),
            ..Default::default()
        }
    }

    /// A patch that marks the job terminally failed.
    pub fn mark_failed() -> Self {
        Self {
            failed: Some(true),
            ..Default::default()
        }
    }

    /// Apply this patch to a job record.
    pub fn apply(&self, job: &mut JobRecord) {
        if let Some(action_url) = &self.action_url {
            job.action_url = action_url.clone();
        }
        if let Some(failure_url) = &self.failure_url {
            job.failure_url = Some(failure_url.clone());
        }
        if let Some(failure_logging) = self.failure_logging {
            job.failure_logging = failure_logging;
        }
        if let Some(method) = self.method {
            job.method = method;
        }
        if let Some(headers) = &self.headers {
            job.headers = headers.clone();
        }
        if let Some(payload) = &self.payload {
            job.payload = Some(payload.clone());
        }
        if let Some(time) = &self.time {
            job.time = time.clone();
        }
        if let Some(time_zone) = &self.time_zone {
            job.time_zone = time_zone.clone();
        }
        if let Some(next_tick) = self.next_tick {
            job.next_tick = next_tick;
        }
        if let Some(failed) = self.failed {
            job.failed = failed;
        }
        job.updated_at = SystemTime::now();
    }
}

/// Write-once failure audit record: a snapshot of the job and the
/// response (or transport error) of a failed dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Unique record identifier.
    pub id: FailureId,
    /// The job whose dispatch failed.
    pub job_id: JobId,
    /// Owner of the job, for scoped queries.
    pub user_id: UserId,
    /// HTTP status of the failed response, if one was received.
    pub status_code: Option<u16>,
    /// When the dispatch started.
    pub request_time: SystemTime,
    /// Wall-clock duration of the dispatch in milliseconds.
    pub request_duration_ms: u64,
    /// Snapshot of the full job configuration at failure time.
    pub job: Value,
    /// Response body, if one was received.
    pub response: Option<String>,
    /// Transport error message, if the request never completed.
    pub error_message: Option<String>,
    /// When the record was created.
    pub created_at: SystemTime,
}

/// Storage trait for the job store and failure audit log.
#[async_trait]
pub trait Storage: Send + Sync {
    // Job operations

    /// Insert a new job definition.
    async fn insert_job(&self, job: JobRecord) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError>;

    /// List a user's jobs ordered by `next_tick` ascending, with
    /// pagination.
    async fn list_jobs(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StorageError>;

    /// Count a user's jobs.
    async fn count_jobs(&self, user_id: &UserId) -> Result<usize, StorageError>;

    /// Apply a partial update and return the updated record.
    async fn update_job(&self, id: &JobId, patch: JobPatch) -> Result<JobRecord, StorageError>;

    /// Delete a job and return the deleted record.
    async fn delete_job(&self, id: &JobId) -> Result<JobRecord, StorageError>;

    /// All active jobs due within the horizon: `failed = false` and
    /// `next_tick <= horizon_ms`, ordered by `next_tick` ascending.
    async fn find_due(&self, horizon_ms: i64) -> Result<Vec<JobRecord>, StorageError>;

    // Failure audit operations

    /// Insert a failure audit record.
    async fn insert_failure(&self, record: FailureRecord) -> Result<(), StorageError>;

    /// List failure records for a user's job, oldest first, with
    /// pagination.
    async fn list_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FailureRecord>, StorageError>;

    /// Count failure records for a user's job.
    async fn count_failures(&self, user_id: &UserId, job_id: &JobId)
        -> Result<usize, StorageError>;
}
