//! Integration tests for the liveness/readiness/metrics surface.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use mcp_gateway::config::MasterConfig;
use mcp_gateway::container::Container;

async fn test_app() -> axum::Router {
    let container = Arc::new(Container::bootstrap(MasterConfig::default()).await.unwrap());
    mcp_gateway::create_router(container)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let response = test_app()
        .await
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_endpoint_reports_uptime_and_empty_servers() {
    let response = test_app()
        .await
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
    assert!(json.get("uptime_seconds").is_some());
    assert_eq!(json["servers"], serde_json::json!({}));
}

#[tokio::test]
async fn readiness_endpoint_is_ok_with_no_configured_servers() {
    // No servers configured means the "every server has an instance" gate
    // vacuously passes.
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_exposes_prometheus_text_format() {
    let response = test_app()
        .await
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("mcp_gateway_uptime_seconds"));
}

#[tokio::test]
async fn nonexistent_route_returns_404() {
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
