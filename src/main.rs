//! chime - a hosted webhook job scheduler.
//!
//! Runs the scheduling engine and the HTTP API in one process. Jobs are
//! registered over the API, persisted in the job store, and fired as
//! webhooks at their computed times.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use chime::api::{create_api_state, start_server, ApiConfig};
use chime::{
    Event, EventBus, EventHandler, HttpDispatcher, InMemoryStorage, Scheduler, SqliteStorage,
    Storage,
};

/// chime - fire webhooks on one-off or cron schedules
#[derive(Parser)]
#[command(name = "chime")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to bind the API server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the API server to
    #[arg(short, long, default_value = "2300")]
    port: u16,

    /// Path to the SQLite database file; omit to run on in-memory
    /// storage (state is lost on restart)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Horizon window in minutes: how far ahead jobs are held as live
    /// timers
    #[arg(long, default_value = "70")]
    horizon_minutes: u64,

    /// Resync interval in seconds
    #[arg(long, default_value = "60")]
    resync_interval: u64,

    /// Drain timeout in seconds for graceful shutdown
    #[arg(long, default_value = "75")]
    drain_timeout: u64,

    /// Timeout in seconds for outbound webhook requests
    #[arg(long, default_value = "30")]
    dispatch_timeout: u64,
}

/// Event handler that logs the firing lifecycle.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobFired { job_id, .. } => {
                info!("Job '{}' fired", job_id);
            }
            Event::DispatchCompleted {
                job_id,
                success,
                status,
                duration,
                ..
            } => {
                if *success {
                    info!("Job '{}' dispatched in {:?} (status: {:?})", job_id, duration, status);
                } else {
                    warn!(
                        "Job '{}' dispatch failed after {:?} (status: {:?})",
                        job_id, duration, status
                    );
                }
            }
            Event::JobRetired { job_id, .. } => {
                info!("Job '{}' completed and was removed", job_id);
            }
            Event::JobMarkedFailed { job_id, .. } => {
                warn!("Job '{}' marked terminally failed", job_id);
            }
            Event::JobEvicted { job_id, next_tick, .. } => {
                info!(
                    "Job '{}' left the horizon (next tick at {}), timer dropped",
                    job_id, next_tick
                );
            }
            Event::FireDeferred { job_id, .. } => {
                warn!("Job '{}' firing deferred: shutting down", job_id);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match &args.db {
        Some(path) => {
            info!("Opening job store at {}", path.display());
            let storage = Arc::new(SqliteStorage::new(path).await?);
            serve(storage, &args).await
        }
        None => {
            warn!("No --db given; using in-memory storage (state is lost on restart)");
            let storage = Arc::new(InMemoryStorage::new());
            serve(storage, &args).await
        }
    }
}

/// Wire up the scheduler and API server over the given store, then run
/// until ctrl-c.
async fn serve<S: Storage + 'static>(
    storage: Arc<S>,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let dispatcher = Arc::new(HttpDispatcher::with_timeout(
        Arc::clone(&storage),
        Duration::from_secs(args.dispatch_timeout),
    ));

    let scheduler = Scheduler::new(Arc::clone(&storage), dispatcher)
        .with_horizon(Duration::from_secs(args.horizon_minutes * 60))
        .with_resync_interval(Duration::from_secs(args.resync_interval))
        .with_drain_timeout(Duration::from_secs(args.drain_timeout))
        .with_event_bus(event_bus);

    info!(
        horizon_minutes = args.horizon_minutes,
        resync_interval = args.resync_interval,
        "Starting scheduler"
    );
    let (handle, scheduler_task) = scheduler.start().await;

    let state = create_api_state(handle.clone(), storage);
    let _server = start_server(ApiConfig::new(&args.host, args.port), state).await?;

    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            match handle.shutdown().await {
                Ok(report) if report.success => {
                    info!(
                        waited = report.waited,
                        deferred = report.deferred,
                        "Drain complete"
                    );
                }
                Ok(report) => {
                    warn!(
                        outstanding = report.outstanding.len(),
                        deferred = report.deferred,
                        "Drain timed out; abandoning in-flight dispatches"
                    );
                }
                Err(e) => {
                    error!("Shutdown error: {}", e);
                }
            }
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    info!("Goodbye!");
    Ok(())
}
