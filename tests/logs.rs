//! Integration tests for request logging and chat history persistence.
//!
//! Builds the real application state against an on-disk SQLite database in
//! a temp directory and a wiremock upstream, then drives the router with
//! `tower::ServiceExt::oneshot` (no TCP listener needed).

use std::time::Duration;

use axum::body::Body;
use http::{Request, StatusCode};
use sqlx::SqlitePool;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use freegate::api::{build_state, create_router};
use freegate::config::Config;

fn completion(content: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{"message": {"role": "assistant", "content": content}}]
    })
}

fn test_config(upstream: &str, db_path: &str, log_requests: bool) -> Config {
    Config::parse_str(&format!(
        r#"
[upstream]
url = "{upstream}/v1"

[defaults]
enable_history = true

[attempt]
timeout_secs = 5
max_retries = 0

[health]
blacklist = []
seed_providers = []

[database]
path = "{db_path}"

[logging]
log_requests = {log_requests}

[[providers]]
name = "DDGS"
"#
    ))
    .expect("valid test config")
}

/// Router plus its pool. The temp dir must outlive both.
async fn setup(
    upstream: &MockServer,
    log_requests: bool,
) -> (tempfile::TempDir, axum::Router, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("freegate.db");
    let config = test_config(&upstream.uri(), db_path.to_str().unwrap(), log_requests);
    let state = build_state(config).await.expect("state");
    let pool = state.db.clone().expect("database configured");
    (dir, create_router(state), pool)
}

/// Poll until the fire-and-forget writer has stored `expected` rows.
async fn wait_for_rows(pool: &SqlitePool, expected: i64) -> i64 {
    let mut count = 0;
    for _ in 0..50 {
        count = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
            .fetch_one(pool)
            .await
            .unwrap();
        if count >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    count
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// ── Request log ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_successful_request_is_logged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello")))
        .mount(&server)
        .await;
    let (_dir, app, pool) = setup(&server, true).await;

    let response = app.oneshot(get("/?text=hi&provider=DDGS")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-freegate-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    assert_eq!(wait_for_rows(&pool, 1).await, 1);
    type Row = (String, String, Option<String>, i64, bool);
    let (correlation_id, requested, provider, attempts, success): Row = sqlx::query_as(
        "SELECT correlation_id, requested_provider, provider, attempts, success FROM requests",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(correlation_id, request_id);
    assert_eq!(requested, "DDGS");
    assert_eq!(provider.as_deref(), Some("DDGS"));
    assert_eq!(attempts, 1);
    assert!(success);
}

#[tokio::test]
async fn test_failed_request_is_logged_with_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;
    let (_dir, app, pool) = setup(&server, true).await;

    let response = app.oneshot(get("/?text=hi&provider=DDGS")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    assert_eq!(wait_for_rows(&pool, 1).await, 1);
    let (provider, attempts, success, error): (Option<String>, i64, bool, Option<String>) =
        sqlx::query_as("SELECT provider, attempts, success, error_message FROM requests")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(provider.is_none());
    assert_eq!(attempts, 2, "DDGS then Auto");
    assert!(!success);
    assert!(error.unwrap().contains("All providers failed"));
}

#[tokio::test]
async fn test_logging_disabled_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("hello")))
        .mount(&server)
        .await;
    let (_dir, app, pool) = setup(&server, false).await;

    let response = app.oneshot(get("/?text=hi")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

// ── Chat history ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_history_carried_across_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "messages": [{"role": "user", "content": "first"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("answer one")))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("answer two")))
        .with_priority(5)
        .mount(&server)
        .await;
    let (_dir, app, _pool) = setup(&server, false).await;

    let response = app.clone().oneshot(get("/?text=first&user=alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.oneshot(get("/?text=second&user=alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    let second: serde_json::Value = serde_json::from_slice(&received[1].body).unwrap();
    let contents: Vec<&str> = second["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["first", "answer one", "second"]);
}
