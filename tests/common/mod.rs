//! Common test utilities shared across integration tests.

use axum::extract::Request;
use axum::http::StatusCode;
use chime::{JobId, JobRecord, Storage, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One request observed by a test receiver.
#[derive(Debug, Clone)]
pub struct Received {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// A local webhook receiver: records every request, optionally delays,
/// then answers with a fixed status.
pub struct Receiver {
    pub base_url: String,
    hits: Arc<Mutex<Vec<Received>>>,
}

impl Receiver {
    pub async fn hit_count(&self) -> usize {
        self.hits.lock().await.len()
    }

    pub async fn requests(&self) -> Vec<Received> {
        self.hits.lock().await.clone()
    }

    /// Poll until at least `count` requests have arrived.
    ///
    /// # Panics
    ///
    /// Panics if the timeout is reached first.
    pub async fn wait_for_hits(&self, count: usize, timeout: Duration) {
        let start = tokio::time::Instant::now();
        loop {
            if self.hit_count().await >= count {
                return;
            }
            if start.elapsed() > timeout {
                panic!(
                    "Timeout waiting for {} request(s), saw {}",
                    count,
                    self.hit_count().await
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Spawn a receiver on an ephemeral port.
pub async fn spawn_receiver(status: u16, delay: Duration) -> Receiver {
    let hits: Arc<Mutex<Vec<Received>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&hits);

    let app = axum::Router::new().fallback(move |request: Request| {
        let hits = Arc::clone(&recorder);
        async move {
            let (parts, body) = request.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX)
                .await
                .unwrap_or_default();

            let mut headers = HashMap::new();
            for (name, value) in parts.headers.iter() {
                headers.insert(
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                );
            }

            hits.lock().await.push(Received {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                headers,
                body: String::from_utf8_lossy(&bytes).to_string(),
            });

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            StatusCode::from_u16(status).unwrap()
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Receiver {
        base_url: format!("http://{}", addr),
        hits,
    }
}

/// Wait for a job to disappear from the store (hard delete).
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_job_absent(storage: &dyn Storage, id: &JobId, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        match storage.get_job(id).await {
            Err(StorageError::NotFound(_)) => return,
            Ok(_) => {}
            Err(e) => panic!("unexpected storage error: {}", e),
        }
        if start.elapsed() > timeout {
            panic!("Timeout waiting for job {} to be deleted", id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a job to be marked terminally failed.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_terminal(storage: &dyn Storage, id: &JobId, timeout: Duration) -> JobRecord {
    let start = tokio::time::Instant::now();
    loop {
        let job = storage.get_job(id).await.unwrap();
        if job.failed {
            return job;
        }
        if start.elapsed() > timeout {
            panic!("Timeout waiting for job {} to go terminal", id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
