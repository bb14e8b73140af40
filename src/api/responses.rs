//! API response types.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::scheduler::SchedulerStatus;
use crate::storage::{FailureRecord, JobRecord};

/// Convert SystemTime to milliseconds since Unix epoch.
fn system_time_to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// A job as returned by the API.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub user_id: String,
    pub time: String,
    pub time_zone: String,
    pub action_url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub payload: Option<Value>,
    pub failure_url: Option<String>,
    pub failure_logging: bool,
    pub next_tick: i64,
    pub failed: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&JobRecord> for JobResponse {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.to_string(),
            user_id: job.user_id.to_string(),
            time: job.time.clone(),
            time_zone: job.time_zone.clone(),
            action_url: job.action_url.clone(),
            method: job.method.to_string(),
            headers: job.headers.clone(),
            payload: job.payload.clone(),
            failure_url: job.failure_url.clone(),
            failure_logging: job.failure_logging,
            next_tick: job.next_tick,
            failed: job.failed,
            created_at: system_time_to_millis(job.created_at),
            updated_at: system_time_to_millis(job.updated_at),
        }
    }
}

/// Response for create/update/delete mutations.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub job: JobResponse,
    pub status: &'static str,
}

/// Paginated job listing.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total_jobs: usize,
    pub jobs_returned: usize,
    pub limit: usize,
    pub page: usize,
    pub skipped: usize,
}

/// A failure audit record as returned by the API.
#[derive(Debug, Serialize)]
pub struct FailureResponse {
    pub id: String,
    pub job_id: String,
    pub status_code: Option<u16>,
    pub request_time: u64,
    pub request_duration_ms: u64,
    pub job: Value,
    pub response: Option<String>,
    pub error_message: Option<String>,
    pub created_at: u64,
}

impl From<FailureRecord> for FailureResponse {
    fn from(record: FailureRecord) -> Self {
        Self {
            id: record.id.to_string(),
            job_id: record.job_id.to_string(),
            status_code: record.status_code,
            request_time: system_time_to_millis(record.request_time),
            request_duration_ms: record.request_duration_ms,
            job: record.job,
            response: record.response,
            error_message: record.error_message,
            created_at: system_time_to_millis(record.created_at),
        }
    }
}

/// Paginated failure listing.
#[derive(Debug, Serialize)]
pub struct FailureListResponse {
    pub failures: Vec<FailureResponse>,
    pub total_failures: usize,
    pub failures_returned: usize,
    pub limit: usize,
    pub page: usize,
    pub skipped: usize,
}

/// Operational counters for health reporting.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub armed: usize,
    pub in_flight: usize,
    pub draining: bool,
    pub deferred: u64,
}

impl From<SchedulerStatus> for StatusResponse {
    fn from(status: SchedulerStatus) -> Self {
        Self {
            armed: status.armed,
            in_flight: status.in_flight,
            draining: status.draining,
            deferred: status.deferred,
        }
    }
}
