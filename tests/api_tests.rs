//! Integration tests for the gateway's own MCP front door and capabilities
//! surface, exercised with no backends configured (an empty `MasterConfig`).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
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

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn capabilities_with_no_backends_is_empty_but_well_shaped() {
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/capabilities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["tools"], json!([]));
    assert_eq!(json["resources"], json!([]));
    assert_eq!(json["prompts"], json!([]));
}

#[tokio::test]
async fn tools_list_with_no_backends_is_empty() {
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/mcp/tools/list")
                .method("POST")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["tools"], json!([]));
}

#[tokio::test]
async fn tools_call_on_unknown_tool_name_returns_structured_error_not_http_error() {
    let response = test_app()
        .await
        .oneshot(json_request(
            "POST",
            "/mcp/tools/call",
            json!({ "name": "nonexistent.tool", "arguments": {} }),
        ))
        .await
        .unwrap();

    // The router turns routing failures into a structured isError body
    // rather than an HTTP error status (spec §4.11).
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["isError"], true);
}

#[tokio::test]
async fn resources_read_on_unknown_uri_returns_structured_error() {
    let response = test_app()
        .await
        .oneshot(json_request(
            "POST",
            "/mcp/resources/read",
            json!({ "uri": "file:///does/not/exist" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["isError"], true);
}

#[tokio::test]
async fn oauth_authorize_without_provider_or_server_id_is_rejected() {
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/oauth/authorize")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_ne!(response.status(), StatusCode::OK);
    assert_ne!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oauth_callback_missing_code_and_state_is_rejected() {
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/oauth/callback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn request_id_header_is_echoed_back() {
    let response = test_app()
        .await
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", "test-correlation-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "test-correlation-id"
    );
}

#[tokio::test]
async fn request_id_is_generated_when_absent() {
    let response = test_app()
        .await
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.headers().get("x-request-id").is_some());
}
