//! API integration tests.
//!
//! These tests drive the HTTP router in-process and check status codes and
//! response bodies for each resource.

use chronoq::api::{ApiState, build_router, create_api_state};
use chronoq::{InMemoryStorage, JobType, NewJob, ScheduleRunner};

use crate::common::memory_engine;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// State with a running schedule runner attached.
fn create_test_state() -> ApiState<InMemoryStorage> {
    let engine = memory_engine();
    let (handle, _task) = ScheduleRunner::new(Arc::clone(&engine))
        .with_tick_interval(Duration::from_secs(60))
        .start();
    create_api_state(engine, Some(handle))
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create_job(router: &Router, body: Value) -> String {
    let (status, json) = send(router, "POST", "/api/jobs", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", json);
    json["id"].as_str().unwrap().to_string()
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let router = build_router(create_test_state());

    let (status, json) = send(&router, "GET", "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Test: Pause and resume the schedule runner via API.
#[tokio::test]
async fn test_pause_resume_scheduler() {
    let router = build_router(create_test_state());

    let (status, json) = send(&router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_running"], true);

    let (status, _) = send(&router, "POST", "/api/scheduler/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(json["is_paused"], true);

    // Manual ticks still work while paused.
    let (status, json) = send(&router, "POST", "/api/scheduler/tick", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["fired"], 0);

    let (status, _) = send(&router, "POST", "/api/scheduler/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(json["is_running"], true);
}

/// Test: Runner endpoints report 503 when no runner is attached.
#[tokio::test]
async fn test_scheduler_endpoints_without_runner() {
    let router = build_router(create_api_state(memory_engine(), None));

    let (status, json) = send(&router, "GET", "/api/scheduler/state", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "SERVICE_UNAVAILABLE");

    // Job endpoints keep working.
    let (status, _) = send(&router, "GET", "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
}

/// Test: Create, fetch, update and delete a job.
#[tokio::test]
async fn test_job_crud() {
    let router = build_router(create_test_state());

    let id = create_job(
        &router,
        json!({
            "name": "welcome",
            "type": "email",
            "payload": {"to": "a@example.com"},
            "priority": 3,
            "maxRetries": 4
        }),
    )
    .await;

    let (status, json) = send(&router, "GET", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "welcome");
    assert_eq!(json["type"], "email");
    assert_eq!(json["status"], "pending");
    assert_eq!(json["max_retries"], 4);
    assert_eq!(json["payload"]["to"], "a@example.com");

    let (status, json) = send(
        &router,
        "PATCH",
        &format!("/api/jobs/{}", id),
        Some(json!({"priority": 8})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["priority"], 8);

    let (status, _) = send(&router, "DELETE", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, json) = send(&router, "GET", &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

/// Test: Invalid job specs and ids are rejected with 400.
#[tokio::test]
async fn test_invalid_requests_return_400() {
    let router = build_router(create_test_state());

    let (status, json) = send(
        &router,
        "POST",
        "/api/jobs",
        Some(json!({"name": "x", "type": "email", "priority": 11})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_ARGUMENT");

    let (status, _) = send(
        &router,
        "POST",
        "/api/jobs",
        Some(json!({"name": "   ", "type": "email"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, "GET", "/api/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, "GET", "/api/executions/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, "GET", "/api/jobs?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// Test: List jobs with status and type filters.
#[tokio::test]
async fn test_list_jobs_with_filters() {
    let router = build_router(create_test_state());

    let mail = create_job(&router, json!({"name": "mail", "type": "email"})).await;
    create_job(&router, json!({"name": "hook", "type": "webhook"})).await;
    create_job(&router, json!({"name": "mail 2", "type": "email"})).await;
    let (status, _) = send(&router, "POST", &format!("/api/jobs/{}/execute", mail), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, json) = send(&router, "GET", "/api/jobs", None).await;
    assert_eq!(json["count"], 3);

    let (_, json) = send(&router, "GET", "/api/jobs?type=email", None).await;
    assert_eq!(json["count"], 2);

    let (_, json) = send(&router, "GET", "/api/jobs?status=running", None).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["jobs"][0]["id"], mail.as_str());

    let (_, json) = send(&router, "GET", "/api/jobs?limit=1", None).await;
    assert_eq!(json["count"], 1);

    let (status, json) = send(&router, "GET", "/api/statistics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 3);
    assert_eq!(json["by_status"]["pending"], 2);
    assert_eq!(json["by_status"]["running"], 1);
}

/// Test: Execute dispatches once; a second execute conflicts.
#[tokio::test]
async fn test_execute_and_executions() {
    let router = build_router(create_test_state());
    let id = create_job(&router, json!({"name": "export", "type": "data_export"})).await;

    let (status, json) = send(&router, "POST", &format!("/api/jobs/{}/execute", id), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["job_id"], id.as_str());
    assert_eq!(json["execution"]["status"], "running");
    let execution_id = json["execution"]["id"].as_str().unwrap().to_string();

    let (status, json) = send(&router, "POST", &format!("/api/jobs/{}/execute", id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "INVALID_STATE");

    let (status, json) = send(&router, "GET", &format!("/api/jobs/{}/executions", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);

    let (status, json) = send(
        &router,
        "GET",
        &format!("/api/executions/{}", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job_id"], id.as_str());

    let (status, json) = send(&router, "POST", &format!("/api/jobs/{}/cancel", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "cancelled");

    let (status, json) = send(&router, "POST", &format!("/api/jobs/{}/requeue", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending");
}

/// Test: Attach, pause and remove a schedule.
#[tokio::test]
async fn test_schedule_endpoints() {
    let router = build_router(create_test_state());
    let id = create_job(&router, json!({"name": "digest", "type": "email"})).await;
    let uri = format!("/api/jobs/{}/schedule", id);

    let (status, json) = send(
        &router,
        "PUT",
        &uri,
        Some(json!({"cronExpression": "61 * * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_ARGUMENT");

    let (status, json) = send(
        &router,
        "PUT",
        &uri,
        Some(json!({"cron_expression": "0 8 * * 1", "timezone": "Europe/Paris"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["timezone"], "Europe/Paris");
    assert_eq!(json["status"], "active");
    assert!(json["next_execution"].is_string());

    let (_, json) = send(&router, "GET", "/api/schedules", None).await;
    assert_eq!(json["count"], 1);

    let (status, json) = send(&router, "POST", &format!("{}/pause", uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "paused");

    let (status, json) = send(&router, "POST", &format!("{}/resume", uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "active");

    let (status, _) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Queue administration endpoints.
#[tokio::test]
async fn test_queue_endpoints() {
    let state = create_test_state();
    let engine = Arc::clone(&state.engine);
    let router = build_router(state);

    let (status, json) = send(
        &router,
        "POST",
        "/api/queues/items",
        Some(json!({"name": "raw", "data": {"n": 1}, "id": "item-1", "priority": 6})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["queue"], "priority");

    let (status, json) = send(&router, "GET", "/api/queues/items/item-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "waiting");

    let (_, json) = send(&router, "GET", "/api/queues/items?state=waiting", None).await;
    assert_eq!(json["count"], 1);

    let (status, json) = send(&router, "GET", "/api/queues/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"]["waiting"], 1);

    let (status, json) = send(&router, "POST", "/api/queues/priority/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["queue"], "priority");
    assert_eq!(json["paused"], true);

    let (status, json) = send(&router, "POST", "/api/queues/bogus/pause", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_ARGUMENT");

    let (status, _) = send(&router, "POST", "/api/queues/priority/resume", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&router, "DELETE", "/api/queues/items/item-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, "DELETE", "/api/queues/items/item-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A failed item makes the queues unhealthy.
    let job = engine
        .create_job(NewJob::new("bad", JobType::Webhook))
        .await
        .unwrap();
    engine.execute_job(&job.id).await.unwrap();
    let item = engine.router().dequeue().await.unwrap().unwrap();
    engine.router().fail(&item, "boom").await.unwrap();

    let (status, json) = send(&router, "GET", "/api/queues/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["healthy"], false);

    let (status, json) = send(
        &router,
        "POST",
        "/api/queues/retry-failed",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["retried"], 1);

    let (status, json) = send(&router, "GET", "/api/queues/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["healthy"], true);

    let (status, _) = send(
        &router,
        "POST",
        "/api/queues/clean",
        Some(json!({"state": "waiting"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(
        &router,
        "POST",
        "/api/queues/clean",
        Some(json!({"state": "completed", "olderThanMs": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["removed"], 0);
}
