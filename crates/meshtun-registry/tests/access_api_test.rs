//! Integration tests for the access endpoint

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use meshtun_registry::{
    build_router, Capabilities, NodeSelector, RegistryState, RelayNode, StaticTokenValidator,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot` method

fn create_test_router(nodes: Vec<RelayNode>) -> (Router, Arc<NodeSelector>) {
    let selector = Arc::new(NodeSelector::with_nodes(nodes));
    let validator = Arc::new(StaticTokenValidator::new(vec!["abcdefg".to_string()]));
    let state = RegistryState::new(selector.clone(), validator);
    (build_router(state), selector)
}

async fn post_access(app: Router, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri("/tunnel/access")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_access_returns_node_address() {
    let (app, selector) = create_test_router(vec![RelayNode::new("n1", "1.2.3.4", 9000)]);

    let body = json!({"authToken": "abcdefg", "isWindows": false}).to_string();
    let (status, value) = post_access(app, body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["data"]["serverAddress"], "1.2.3.4:9000");
    assert!(value["error"].is_null());
    assert_eq!(selector.nodes()[0].load, 0);
}

#[tokio::test]
async fn test_access_bad_token() {
    let (app, selector) = create_test_router(vec![RelayNode::new("n1", "1.2.3.4", 9000)]);

    let body = json!({"authToken": "wrong", "isWindows": false}).to_string();
    let (status, value) = post_access(app, body).await;

    assert_eq!(status, StatusCode::OK);
    assert!(value["data"].is_null());
    assert_eq!(value["error"], "auth fail");
    assert_eq!(selector.nodes()[0].load, 0);
}

#[tokio::test]
async fn test_access_malformed_body() {
    let (app, _) = create_test_router(vec![RelayNode::new("n1", "1.2.3.4", 9000)]);

    let (status, value) = post_access(app, "{not json".to_string()).await;

    assert_eq!(status, StatusCode::OK);
    assert!(value["data"].is_null());
    let error = value["error"].as_str().unwrap();
    assert!(!error.is_empty());
    assert_ne!(error, "auth fail");
}

#[tokio::test]
async fn test_access_windows_needs_driver_capable_node() {
    let (app, _) = create_test_router(vec![RelayNode::new("n1", "1.2.3.4", 9000)]);
    let body = json!({"authToken": "abcdefg", "isWindows": true}).to_string();
    let (_, value) = post_access(app, body).await;
    assert!(value["data"].is_null());
    assert_eq!(value["error"], "no available node");

    let (app, _) = create_test_router(vec![
        RelayNode::new("n1", "1.2.3.4", 9000),
        RelayNode::new("n2", "5.6.7.8", 9001).with_capabilities(Capabilities::WINDOWS_DRIVER),
    ]);
    let body = json!({"authToken": "abcdefg", "isWindows": true}).to_string();
    let (_, value) = post_access(app, body).await;
    assert_eq!(value["data"]["serverAddress"], "5.6.7.8:9001");
}

#[tokio::test]
async fn test_access_empty_pool() {
    let (app, _) = create_test_router(Vec::new());
    let body = json!({"authToken": "abcdefg"}).to_string();
    let (status, value) = post_access(app, body).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["error"], "no available node");
}

#[tokio::test]
async fn test_health_reports_pool() {
    let (app, selector) = create_test_router(vec![
        RelayNode::new("n1", "1.2.3.4", 9000),
        RelayNode::new("n2", "5.6.7.8", 9001),
    ]);
    selector.set_online("n2", false);

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["nodes"], 2);
    assert_eq!(value["available"], 1);
}

#[tokio::test]
async fn test_repeated_access_keeps_capacity_bounded_node() {
    let (app, selector) =
        create_test_router(vec![RelayNode::new("n1", "1.2.3.4", 9000).with_capacity(2)]);

    // Every reconnecting client asks again
    for _ in 0..5 {
        let body = json!({"authToken": "abcdefg", "isWindows": false}).to_string();
        let (_, value) = post_access(app.clone(), body).await;
        assert_eq!(value["data"]["serverAddress"], "1.2.3.4:9000");
        assert!(value["error"].is_null());
    }
    assert_eq!(selector.available_count(), 1);
}
