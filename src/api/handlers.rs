//! API request handlers.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::schedule::{is_valid_time, is_valid_timezone, Schedule};
use crate::core::types::{JobId, UserId};
use crate::scheduler::SchedulerHandle;
use crate::storage::{HttpMethod, JobPatch, JobRecord, Storage};

use super::errors::{ApiError, FieldError};
use super::responses::{
    FailureListResponse, FailureResponse, HealthResponse, JobListResponse, JobResponse,
    MutationResponse, StatusResponse,
};

/// Header carrying the caller's opaque owner identity. Authentication
/// itself happens upstream; this value is only used for attribution and
/// scoping.
const USER_ID_HEADER: &str = "x-user-id";

/// Page size cap for list endpoints.
const MAX_PAGE_LIMIT: usize = 100;
const DEFAULT_PAGE_LIMIT: usize = 20;

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub handle: SchedulerHandle,
    pub storage: Arc<S>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            storage: Arc::clone(&self.storage),
        }
    }
}

/// Body of a job creation request.
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub action_url: String,
    pub failure_url: Option<String>,
    #[serde(default)]
    pub failure_logging: bool,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub payload: Option<Value>,
    pub time: String,
    pub time_zone: String,
}

/// Body of a job update request; every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateJobRequest {
    pub action_url: Option<String>,
    pub failure_url: Option<String>,
    pub failure_logging: Option<bool>,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub payload: Option<Value>,
    pub time: Option<String>,
    pub time_zone: Option<String>,
}

/// Query parameters for paginated list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub page: Option<usize>,
    pub skip: Option<usize>,
}

impl PageQuery {
    /// Resolve to (limit, page, skipped offset) with caps and defaults.
    fn resolve(&self) -> (usize, usize, usize) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .min(MAX_PAGE_LIMIT)
            .max(1);
        let page = self.page.unwrap_or(1).max(1);
        let skipped = self.skip.unwrap_or(0) + limit * (page - 1);
        (limit, page, skipped)
    }
}

fn require_user(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(UserId::new)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::parse(raw).map_err(|_| ApiError::NotFound(format!("job not found: {}", raw)))
}

fn is_valid_url(raw: &str) -> bool {
    match reqwest::Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

fn validate_create(request: &CreateJobRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if !is_valid_url(&request.action_url) {
        errors.push(FieldError::new("action_url", "must be a valid http(s) URL"));
    }
    if let Some(url) = &request.failure_url {
        if !is_valid_url(url) {
            errors.push(FieldError::new("failure_url", "must be a valid http(s) URL"));
        }
    }
    if let Some(method) = &request.method {
        if method.parse::<HttpMethod>().is_err() {
            errors.push(FieldError::new(
                "method",
                "must be one of GET, POST, PUT, DELETE",
            ));
        }
    }
    if !is_valid_timezone(&request.time_zone) {
        errors.push(FieldError::new("time_zone", "unknown IANA timezone"));
    } else if !is_valid_time(&request.time, &request.time_zone) {
        errors.push(FieldError::new(
            "time",
            "must be a cron expression or a parseable date/time",
        ));
    }

    errors
}

fn validate_update(request: &UpdateJobRequest, time: &str, time_zone: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if let Some(url) = &request.action_url {
        if !is_valid_url(url) {
            errors.push(FieldError::new("action_url", "must be a valid http(s) URL"));
        }
    }
    if let Some(url) = &request.failure_url {
        if !is_valid_url(url) {
            errors.push(FieldError::new("failure_url", "must be a valid http(s) URL"));
        }
    }
    if let Some(method) = &request.method {
        if method.parse::<HttpMethod>().is_err() {
            errors.push(FieldError::new(
                "method",
                "must be one of GET, POST, PUT, DELETE",
            ));
        }
    }
    if !is_valid_timezone(time_zone) {
        errors.push(FieldError::new("time_zone", "unknown IANA timezone"));
    } else if !is_valid_time(time, time_zone) {
        errors.push(FieldError::new(
            "time",
            "must be a cron expression or a parseable date/time",
        ));
    }

    errors
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Read the scheduler's operational counters.
pub async fn scheduler_status<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.handle.status().await?;
    Ok(Json(StatusResponse::from(status)))
}

/// Create a job: validate, compute its first tick, persist, and hand it
/// to the scheduler.
pub async fn create_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let user = require_user(&headers)?;

    let errors = validate_create(&request);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let next_tick = Schedule::new(&request.time, &request.time_zone)
        .next_tick_ms(Utc::now())
        .ok_or_else(|| {
            ApiError::Unprocessable("no future ticks to process for this job".to_string())
        })?;

    let method = match &request.method {
        Some(raw) => raw.parse::<HttpMethod>().unwrap_or(HttpMethod::Get),
        None => HttpMethod::Get,
    };

    let mut job = JobRecord::new(user, request.time, request.time_zone, request.action_url)
        .with_method(method)
        .with_headers(request.headers)
        .with_failure_logging(request.failure_logging)
        .with_next_tick(next_tick);
    if let Some(url) = request.failure_url {
        job = job.with_failure_url(url);
    }
    if let Some(payload) = request.payload {
        job = job.with_payload(payload);
    }

    state.storage.insert_job(job.clone()).await?;

    // The engine decides whether the tick warrants a live timer or the
    // job stays dormant until a resync promotes it.
    state.handle.schedule(job.clone()).await?;

    Ok(Json(MutationResponse {
        job: JobResponse::from(&job),
        status: "CREATED",
    }))
}

/// Fetch one of the caller's jobs.
pub async fn get_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let user = require_user(&headers)?;
    let id = parse_job_id(&job_id)?;

    let job = state.storage.get_job(&id).await?;
    if job.user_id != user {
        return Err(ApiError::NotFound(format!("job not found: {}", id)));
    }

    Ok(Json(JobResponse::from(&job)))
}

/// List the caller's jobs, soonest tick first.
pub async fn list_jobs<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let user = require_user(&headers)?;
    let (limit, page, skipped) = query.resolve();

    let total_jobs = state.storage.count_jobs(&user).await?;
    let jobs = state.storage.list_jobs(&user, limit, skipped).await?;
    let jobs: Vec<JobResponse> = jobs.iter().map(JobResponse::from).collect();

    Ok(Json(JobListResponse {
        jobs_returned: jobs.len(),
        jobs,
        total_jobs,
        limit,
        page,
        skipped,
    }))
}

/// Update one of the caller's jobs. A schedule change recomputes the
/// next tick; the stale timer is cancelled before the store is touched
/// so it can never fire with superseded configuration.
pub async fn update_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Json(request): Json<UpdateJobRequest>,
) -> Result<Json<MutationResponse>, ApiError> {
    let user = require_user(&headers)?;
    let id = parse_job_id(&job_id)?;

    let current = state.storage.get_job(&id).await?;
    if current.user_id != user {
        return Err(ApiError::NotFound(format!("job not found: {}", id)));
    }

    let time = request.time.as_deref().unwrap_or(&current.time);
    let time_zone = request.time_zone.as_deref().unwrap_or(&current.time_zone);

    let errors = validate_update(&request, time, time_zone);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let mut patch = JobPatch {
        action_url: request.action_url,
        failure_url: request.failure_url,
        failure_logging: request.failure_logging,
        method: request
            .method
            .as_deref()
            .and_then(|m| m.parse::<HttpMethod>().ok()),
        headers: request.headers,
        payload: request.payload,
        time: request.time.clone(),
        time_zone: request.time_zone.clone(),
        ..Default::default()
    };

    if request.time.is_some() || request.time_zone.is_some() {
        let next_tick = Schedule::new(time, time_zone)
            .next_tick_ms(Utc::now())
            .ok_or_else(|| {
                ApiError::Unprocessable("no future ticks to process for this job".to_string())
            })?;
        patch.next_tick = Some(next_tick);
    }

    state.handle.cancel(id.clone()).await?;
    let updated = state.storage.update_job(&id, patch).await?;
    state.handle.schedule(updated.clone()).await?;

    Ok(Json(MutationResponse {
        job: JobResponse::from(&updated),
        status: "UPDATED",
    }))
}

/// Delete one of the caller's jobs: cancel its timer, then hard-delete
/// the record.
pub async fn delete_job<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<MutationResponse>, ApiError> {
    let user = require_user(&headers)?;
    let id = parse_job_id(&job_id)?;

    let current = state.storage.get_job(&id).await?;
    if current.user_id != user {
        return Err(ApiError::NotFound(format!("job not found: {}", id)));
    }

    state.handle.cancel(id.clone()).await?;
    let deleted = state.storage.delete_job(&id).await?;

    Ok(Json(MutationResponse {
        job: JobResponse::from(&deleted),
        status: "DELETED",
    }))
}

/// List failure audit records for one of the caller's jobs.
pub async fn list_failures<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<FailureListResponse>, ApiError> {
    let user = require_user(&headers)?;
    let id = parse_job_id(&job_id)?;
    let (limit, page, skipped) = query.resolve();

    let total_failures = state.storage.count_failures(&user, &id).await?;
    let failures = state.storage.list_failures(&user, &id, limit, skipped).await?;
    let failures: Vec<FailureResponse> = failures.into_iter().map(FailureResponse::from).collect();

    Ok(Json(FailureListResponse {
        failures_returned: failures.len(),
        failures,
        total_failures,
        limit,
        page,
        skipped,
    }))
}
