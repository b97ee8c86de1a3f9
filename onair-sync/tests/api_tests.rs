//! Integration tests for onair-sync API endpoints
//!
//! Tests cover:
//! - Health and build info
//! - SSE handshake and topic subscription
//! - Mirror enqueue, state, and rejection once the queue is dead

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use onair_sync::api::{build_router, AppContext};
use onair_sync::mirror::{CommandExecutor, CommandOutcome, MirrorStatement};
use onair_sync::{Error, Result, SyncConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

/// Test executor: records statements, fails those whose SQL starts with "FAIL"
#[derive(Default)]
struct RecordingExecutor {
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, statement: &MirrorStatement) -> Result<CommandOutcome> {
        self.executed.lock().push(statement.sql.clone());
        if statement.sql.starts_with("FAIL") {
            return Err(Error::TransientExecution("legacy store refused".to_string()));
        }
        Ok(CommandOutcome { rows_affected: 1 })
    }
}

struct TestApp {
    router: Router,
    ctx: AppContext,
    executor: Arc<RecordingExecutor>,
    _fatal_dir: TempDir,
}

/// Test helper: app with fast retries and a temporary fatal log dir
fn setup_app(max_attempts: u32) -> TestApp {
    let fatal_dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        max_attempts,
        base_backoff_ms: 5,
        max_backoff_ms: 20,
        fatal_log_dir: fatal_dir.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let executor = Arc::new(RecordingExecutor::default());
    let ctx = AppContext::new(config, executor.clone());
    TestApp {
        router: build_router(ctx.clone()),
        ctx,
        executor,
        _fatal_dir: fatal_dir,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Test helper: Extract JSON body from response
async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

/// Test helper: read the next SSE record as (event name, data JSON)
async fn next_sse_event(body: &mut Body) -> (String, Value) {
    let frame = body
        .frame()
        .await
        .expect("stream ended")
        .expect("stream error");
    let bytes = frame.into_data().expect("data frame");
    let text = std::str::from_utf8(&bytes).unwrap();

    let mut event = String::new();
    let mut data = String::new();
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim_start().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim_start());
        }
    }
    (event, serde_json::from_str(&data).expect("data is JSON"))
}

// =============================================================================
// Service info
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = setup_app(5);

    let response = app.router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "onair-sync");
    assert_eq!(body["mirrorAlive"], true);
    assert_eq!(body["clients"], 0);
    assert!(body["version"].is_string());
    assert!(body.get("snapshotPersisted").is_none());
}

#[tokio::test]
async fn test_build_info_endpoint() {
    let app = setup_app(5);

    let response = app.router.oneshot(get("/build_info")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert!(body["gitHash"].is_string());
    assert!(body["buildTimestamp"].is_string());
    assert!(body["buildProfile"].is_string());
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn test_event_stream_handshake_and_subscribe() {
    let app = setup_app(5);

    let response = app.router.clone().oneshot(get("/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut stream = response.into_body();
    let (event, data) = next_sse_event(&mut stream).await;
    assert_eq!(event, "connected");
    let client_id = data["payload"]["clientId"].as_str().unwrap().to_string();
    assert_eq!(app.ctx.broadcaster.client_count(), 1);

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/events/subscribe",
            json!({"clientId": client_id, "topics": ["mirror", "weather"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["subscribed"], json!(["mirror"]));

    let (event, data) = next_sse_event(&mut stream).await;
    assert_eq!(event, "subscribed");
    assert_eq!(data["payload"]["topics"], json!(["mirror"]));

    let response = app
        .router
        .oneshot(post_json(
            "/events/unsubscribe",
            json!({"clientId": client_id, "topics": ["mirror"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["unsubscribed"], json!(["mirror"]));
}

#[tokio::test]
async fn test_subscribe_unknown_client_is_404() {
    let app = setup_app(5);

    let response = app
        .router
        .oneshot(post_json(
            "/events/subscribe",
            json!({"clientId": uuid::Uuid::new_v4(), "topics": ["mirror"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"], "client_not_found");
}

// =============================================================================
// Mirror queue
// =============================================================================

#[tokio::test]
async fn test_enqueue_is_accepted_and_applied() {
    let app = setup_app(5);

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/mirror/enqueue",
            json!({"commands": [
                {"sql": "REPLACE INTO plays (id) VALUES (?)", "params": [41]},
                {"sql": "DELETE FROM requests WHERE id = ?", "params": [7]}
            ]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = extract_json(response.into_body()).await;
    let commands = body["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0]["status"], "pending");
    assert_eq!(commands[0]["attempts"], 0);
    assert!(commands[0]["id"].is_string());

    app.ctx.queue.wait_idle().await.unwrap();
    assert_eq!(
        *app.executor.executed.lock(),
        vec![
            "REPLACE INTO plays (id) VALUES (?)",
            "DELETE FROM requests WHERE id = ?"
        ]
    );

    let response = app.router.oneshot(get("/mirror/state")).await.unwrap();
    let state = extract_json(response.into_body()).await;
    assert_eq!(state["alive"], true);
    assert_eq!(state["depth"], 0);
    assert_eq!(state["maxAttempts"], 5);
}

#[tokio::test]
async fn test_enqueue_rejected_after_fatal_stop() {
    let app = setup_app(1);

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/mirror/enqueue",
            json!({"commands": [{"sql": "FAIL UPDATE songs SET x = 1"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    app.ctx.queue.wait_idle().await.unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/mirror/enqueue",
            json!({"commands": [{"sql": "UPDATE songs SET x = 2"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"], "queue_stopped");

    let response = app.router.oneshot(get("/health")).await.unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["mirrorAlive"], false);
    assert_eq!(body["snapshotPersisted"], true);
}

#[tokio::test]
async fn test_health_reports_lost_fatal_snapshot() {
    let blocker_dir = tempfile::tempdir().unwrap();
    let blocker = blocker_dir.path().join("occupied");
    std::fs::write(&blocker, "x").unwrap();

    let config = SyncConfig {
        max_attempts: 1,
        fatal_log_dir: blocker,
        ..SyncConfig::default()
    };
    let ctx = AppContext::new(config, Arc::new(RecordingExecutor::default()));
    let router = build_router(ctx.clone());

    ctx.queue
        .enqueue(vec![MirrorStatement::new("FAIL DELETE FROM requests")])
        .unwrap();
    assert!(ctx.queue.wait_idle().await.is_err());

    let response = router.clone().oneshot(get("/health")).await.unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["snapshotPersisted"], false);

    let response = router.oneshot(get("/mirror/state")).await.unwrap();
    let state = extract_json(response.into_body()).await;
    assert_eq!(state["snapshotPersisted"], false);
}
