//! API integration tests.
//!
//! Drive the axum router directly and verify endpoint behavior,
//! validation, ownership scoping, and scheduler wiring.

use chime::api::{build_router, create_api_state};
use chime::{HttpDispatcher, InMemoryStorage, Scheduler, SchedulerHandle, Storage, UserId};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

async fn create_test_router() -> (Router, Arc<InMemoryStorage>, SchedulerHandle) {
    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(HttpDispatcher::new(Arc::clone(&storage)));

    let (handle, _task) = Scheduler::new(Arc::clone(&storage), dispatcher)
        .with_resync_interval(Duration::from_secs(3600))
        .start()
        .await;

    let router = build_router(create_api_state(handle.clone(), Arc::clone(&storage)));
    (router, storage, handle)
}

fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user);
    }
    match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn create_body(time: String) -> Value {
    json!({
        "action_url": "http://127.0.0.1:1/hook",
        "method": "POST",
        "payload": { "hello": "world" },
        "time": time,
        "time_zone": "UTC",
    })
}

fn future_one_off() -> String {
    (Utc::now() + ChronoDuration::hours(1)).to_rfc3339()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (router, _storage, _handle) = create_test_router().await;

    let response = router
        .oneshot(request("GET", "/api/health", None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_create_job_persists_and_arms() {
    let (router, storage, handle) = create_test_router().await;

    let response = router
        .oneshot(request(
            "POST",
            "/api/jobs",
            Some("user-1"),
            Some(create_body(future_one_off())),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "CREATED");
    assert_eq!(json["job"]["user_id"], "user-1");
    assert_eq!(json["job"]["method"], "POST");
    assert!(json["job"]["next_tick"].as_i64().unwrap() > Utc::now().timestamp_millis());
    assert_eq!(json["job"]["failed"], false);

    // Persisted and armed (one hour out is inside the default horizon)
    assert_eq!(storage.count_jobs(&UserId::new("user-1")).await.unwrap(), 1);
    assert_eq!(handle.status().await.unwrap().armed, 1);
}

#[tokio::test]
async fn test_create_job_requires_owner_header() {
    let (router, _storage, _handle) = create_test_router().await;

    let response = router
        .oneshot(request(
            "POST",
            "/api/jobs",
            None,
            Some(create_body(future_one_off())),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_job_validates_fields() {
    let (router, _storage, _handle) = create_test_router().await;

    let body = json!({
        "action_url": "not a url",
        "method": "PATCH",
        "time": "never oclock",
        "time_zone": "Mars/Olympus_Mons",
    });

    let response = router
        .oneshot(request("POST", "/api/jobs", Some("user-1"), Some(body)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    let errors = json["errors"].as_array().unwrap();
    let fields: Vec<&str> = errors
        .iter()
        .map(|e| e["field"].as_str().unwrap())
        .collect();
    assert!(fields.contains(&"action_url"));
    assert!(fields.contains(&"method"));
    assert!(fields.contains(&"time_zone"));
}

#[tokio::test]
async fn test_create_job_with_no_future_tick_is_rejected() {
    let (router, storage, _handle) = create_test_router().await;

    let past = (Utc::now() - ChronoDuration::hours(1)).to_rfc3339();
    let response = router
        .oneshot(request(
            "POST",
            "/api/jobs",
            Some("user-1"),
            Some(create_body(past)),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNPROCESSABLE");

    // Nothing was persisted
    assert_eq!(storage.count_jobs(&UserId::new("user-1")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_get_job_is_owner_scoped() {
    let (router, _storage, _handle) = create_test_router().await;

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/api/jobs",
            Some("user-1"),
            Some(create_body(future_one_off())),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();

    // Owner sees it
    let response = router
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/jobs/{}", id),
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Someone else gets a 404, not a 403 leak
    let response = router
        .oneshot(request(
            "GET",
            &format!("/api/jobs/{}", id),
            Some("user-2"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_jobs_paginates() {
    let (router, _storage, _handle) = create_test_router().await;

    for _ in 0..3 {
        let response = router
            .clone()
            .oneshot(request(
                "POST",
                "/api/jobs",
                Some("user-1"),
                Some(create_body(future_one_off())),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .oneshot(request(
            "GET",
            "/api/jobs?limit=2&page=1",
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_jobs"], 3);
    assert_eq!(json["jobs_returned"], 2);
    assert_eq!(json["limit"], 2);
    assert_eq!(json["page"], 1);
    assert_eq!(json["jobs"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_update_job_recomputes_next_tick() {
    let (router, _storage, _handle) = create_test_router().await;

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/api/jobs",
            Some("user-1"),
            Some(create_body(future_one_off())),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();
    let original_tick = created["job"]["next_tick"].as_i64().unwrap();

    let new_time = (Utc::now() + ChronoDuration::hours(2)).to_rfc3339();
    let response = router
        .oneshot(request(
            "PUT",
            &format!("/api/jobs/{}", id),
            Some("user-1"),
            Some(json!({ "time": new_time })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "UPDATED");
    assert!(json["job"]["next_tick"].as_i64().unwrap() > original_tick);
}

#[tokio::test]
async fn test_delete_job_cancels_and_removes() {
    let (router, storage, handle) = create_test_router().await;

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/api/jobs",
            Some("user-1"),
            Some(create_body(future_one_off())),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();
    assert_eq!(handle.status().await.unwrap().armed, 1);

    let response = router
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/api/jobs/{}", id),
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "DELETED");

    // Gone from the store, timer dropped
    assert_eq!(storage.count_jobs(&UserId::new("user-1")).await.unwrap(), 0);
    assert_eq!(handle.status().await.unwrap().armed, 0);

    let response = router
        .oneshot(request(
            "GET",
            &format!("/api/jobs/{}", id),
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_failures_empty() {
    let (router, _storage, _handle) = create_test_router().await;

    let response = router
        .clone()
        .oneshot(request(
            "POST",
            "/api/jobs",
            Some("user-1"),
            Some(create_body(future_one_off())),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();

    let response = router
        .oneshot(request(
            "GET",
            &format!("/api/jobs/{}/failures", id),
            Some("user-1"),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_failures"], 0);
    assert!(json["failures"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_scheduler_status_endpoint() {
    let (router, _storage, _handle) = create_test_router().await;

    let response = router
        .oneshot(request("GET", "/api/scheduler/status", None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["armed"], 0);
    assert_eq!(json["in_flight"], 0);
    assert_eq!(json["draining"], false);
    assert_eq!(json["deferred"], 0);
}
