//! Outbound dispatch: the HTTP action call for a firing job.
//!
//! The dispatcher never fails: transport errors and non-success statuses
//! are both captured in the returned [`DispatchOutcome`] so the scheduler
//! always receives a result. Failure escalation (the secondary
//! notification call and the audit record) is the dispatcher's own
//! responsibility.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::core::types::FailureId;
use crate::storage::{FailureRecord, HttpMethod, JobRecord, Storage};

/// Header attached to every action call so the receiving endpoint can
/// correlate the request with the job that produced it.
pub const JOB_ID_HEADER: &str = "job-id";

/// Default timeout for a single outbound request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Whether the response had a success-class HTTP status.
    pub succeeded: bool,
    /// HTTP status, if a response was received at all.
    pub status: Option<u16>,
    /// Response body, if a response was received.
    pub body: Option<String>,
    /// Transport error message, if the request never completed.
    pub error_message: Option<String>,
    /// When the request started.
    pub started_at: SystemTime,
    /// When the request finished (or failed).
    pub finished_at: SystemTime,
}

impl DispatchOutcome {
    /// Wall-clock duration of the dispatch.
    pub fn duration(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or(Duration::ZERO)
    }
}

/// Performs the outbound action call for a firing job.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatch the job's action call. Never returns an error: failures
    /// of any kind are captured in the outcome.
    async fn dispatch(&self, job: &JobRecord) -> DispatchOutcome;
}

/// Payload of the best-effort failure notification POST.
#[derive(Debug, Serialize)]
struct FailureNotice<'a> {
    start_time: u64,
    end_time: u64,
    response: NoticeResponse<'a>,
}

#[derive(Debug, Serialize)]
struct NoticeResponse<'a> {
    status: Option<u16>,
    body: Option<&'a str>,
    error_message: Option<&'a str>,
}

/// HTTP dispatcher backed by reqwest, with failure notification and
/// audit logging against the job store.
pub struct HttpDispatcher<S: Storage> {
    client: reqwest::Client,
    storage: Arc<S>,
}

impl<S: Storage> HttpDispatcher<S> {
    /// Create a dispatcher with the default request timeout.
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_timeout(storage, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a dispatcher with a custom request timeout.
    pub fn with_timeout(storage: Arc<S>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self { client, storage }
    }

    /// Perform the action call itself.
    async fn perform(&self, job: &JobRecord) -> DispatchOutcome {
        let started_at = SystemTime::now();

        let mut request = self
            .client
            .request(to_reqwest_method(job.method), &job.action_url)
            .header(JOB_ID_HEADER, job.id.to_string());

        for (name, value) in &job.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if job.method.has_body() {
            if let Some(payload) = &job.payload {
                request = request.json(payload);
            }
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                DispatchOutcome {
                    succeeded: status.is_success(),
                    status: Some(status.as_u16()),
                    body: Some(body),
                    error_message: None,
                    started_at,
                    finished_at: SystemTime::now(),
                }
            }
            Err(e) => DispatchOutcome {
                succeeded: false,
                status: None,
                body: None,
                error_message: Some(e.to_string()),
                started_at,
                finished_at: SystemTime::now(),
            },
        }
    }

    /// Best-effort POST to the configured failure URL. Its own failure
    /// is swallowed.
    async fn notify_failure(&self, job: &JobRecord, url: &str, outcome: &DispatchOutcome) {
        let notice = FailureNotice {
            start_time: epoch_millis(outcome.started_at),
            end_time: epoch_millis(outcome.finished_at),
            response: NoticeResponse {
                status: outcome.status,
                body: outcome.body.as_deref(),
                error_message: outcome.error_message.as_deref(),
            },
        };

        if let Err(e) = self.client.post(url).json(&notice).send().await {
            warn!(job_id = %job.id, error = %e, "Failure notification could not be delivered");
        }
    }

    /// Write a failure audit record. Insert errors are logged, not
    /// escalated.
    async fn record_failure(&self, job: &JobRecord, outcome: &DispatchOutcome) {
        let snapshot = match serde_json::to_value(job) {
            Ok(value) => value,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to snapshot job for audit record");
                return;
            }
        };

        let record = FailureRecord {
            id: FailureId::new(),
            job_id: job.id.clone(),
            user_id: job.user_id.clone(),
            status_code: outcome.status,
            request_time: outcome.started_at,
            request_duration_ms: outcome.duration().as_millis() as u64,
            job: snapshot,
            response: outcome.body.clone(),
            error_message: outcome.error_message.clone(),
            created_at: SystemTime::now(),
        };

        if let Err(e) = self.storage.insert_failure(record).await {
            warn!(job_id = %job.id, error = %e, "Failed to write failure audit record");
        }
    }
}

#[async_trait]
impl<S: Storage + 'static> Dispatcher for HttpDispatcher<S> {
    async fn dispatch(&self, job: &JobRecord) -> DispatchOutcome {
        let outcome = self.perform(job).await;

        if !outcome.succeeded {
            if let Some(url) = &job.failure_url {
                self.notify_failure(job, url, &outcome).await;
            }
            if job.failure_logging {
                self.record_failure(job, &outcome).await;
            }
        }

        outcome
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
