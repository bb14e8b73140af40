//! HTTP API module.
//!
//! Provides REST endpoints for managing webhook jobs, reading failure
//! audit logs, and observing scheduler health.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, FieldError};
pub use handlers::{ApiState, CreateJobRequest, PageQuery, UpdateJobRequest};
pub use responses::*;

use axum::{
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scheduler::SchedulerHandle;
use crate::storage::Storage;

/// Configuration for the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2300,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("invalid socket address")
    }
}

/// Build the API router with all endpoints.
pub fn build_router<S: Storage + 'static>(state: ApiState<S>) -> Router {
    Router::new()
        // Health and operational state
        .route("/api/health", get(handlers::health))
        .route(
            "/api/scheduler/status",
            get(handlers::scheduler_status::<S>),
        )
        // Jobs
        .route(
            "/api/jobs",
            get(handlers::list_jobs::<S>).post(handlers::create_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}",
            get(handlers::get_job::<S>)
                .put(handlers::update_job::<S>)
                .delete(handlers::delete_job::<S>),
        )
        // Failure audit log
        .route(
            "/api/jobs/{job_id}/failures",
            get(handlers::list_failures::<S>),
        )
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from scheduler components.
pub fn create_api_state<S: Storage>(handle: SchedulerHandle, storage: Arc<S>) -> ApiState<S> {
    ApiState { handle, storage }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: Storage + 'static>(
    config: ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let addr = config.socket_addr();

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
