//! HTTP API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use berth::session::{Expect, RecordPatch, SessionState};
use serde_json::Value;
use tower::ServiceExt;

mod common;
use common::TestEnv;

async fn get(env: &TestEnv, uri: &str) -> (StatusCode, Value) {
    let response = env
        .router()
        .oneshot(
            Request::builder()
                .uri(uri)
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = TestEnv::new().await;
    let (status, json) = get(&env, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_list_sessions_empty() {
    let env = TestEnv::new().await;
    let (status, json) = get(&env, "/sessions").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sessions"].as_array().map(Vec::len), Some(0));
    assert_eq!(json["connections"], 0);
}

#[tokio::test]
async fn test_get_session() {
    let env = TestEnv::new().await;
    env.registry()
        .transition(
            "u1",
            Expect::Absent,
            SessionState::Active,
            RecordPatch::default()
                .owner("conn-1")
                .container_name("berth-brave-quiet-otter")
                .lesson("intro", "ubuntu"),
        )
        .await
        .unwrap();

    let (status, json) = get(&env, "/sessions/u1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["user_id"], "u1");
    assert_eq!(json["container_name"], "berth-brave-quiet-otter");
    assert_eq!(json["owner_connection_id"], "conn-1");

    let (status, json) = get(&env, "/sessions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["sessions"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_get_unknown_session() {
    let env = TestEnv::new().await;
    let (status, _) = get(&env, "/sessions/nobody").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
