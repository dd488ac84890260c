pub mod aggregator;
pub mod auth;
pub mod backend;
pub mod circuit_breaker;
pub mod config;
pub mod container;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod load_balancer;
pub mod logging;
pub mod oauth_flow;
pub mod retry;
pub mod route_registry;
pub mod router;
pub mod token_store;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use container::Container;

/// Generates a UUID v4 correlation ID for each request (or propagates an
/// inbound `X-Request-Id`), records it on the tracing span, and echoes it
/// back in the response header.
async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("request_id", &request_id.as_str());
    tracing::debug!(request_id = %request_id, "request correlation ID assigned");

    let mut response = next.run(req).await;

    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

/// Builds the application router from a bootstrapped [`Container`].
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(container: Arc<Container>) -> Router {
    Router::new()
        .route("/mcp/tools/list", post(handlers::mcp::tools_list))
        .route("/mcp/tools/call", post(handlers::mcp::tools_call))
        .route("/mcp/resources/list", post(handlers::mcp::resources_list))
        .route("/mcp/resources/read", post(handlers::mcp::resources_read))
        .route("/capabilities", get(handlers::capabilities::capabilities))
        .route("/health", get(handlers::health::health))
        .route("/health/ready", get(handlers::health::ready))
        .route("/oauth/authorize", get(handlers::oauth::authorize))
        .route(
            "/oauth/callback",
            get(handlers::oauth::callback).post(handlers::oauth::callback),
        )
        .route("/metrics", get(handlers::metrics::metrics))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(container)
}
