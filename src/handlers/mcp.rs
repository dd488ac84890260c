//! `/mcp/tools/*` and `/mcp/resources/*` — the gateway's own front door.
//!
//! JSON body in, JSON body out, bearer token pulled from the `Authorization`
//! header; every route is a thin wrapper around `Router::call`/`Router::read`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::container::Container;
use crate::router::{CallOutcome, CallToolRequest, ReadResourceRequest};

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string()
}

/// Shapes a [`CallOutcome`] into the response body: a plain result for
/// `CallOutcome::Result`, or
/// `{isError:false, content:{type:"oauth_delegation", delegation:{...}}}`
/// for a delegation.
fn outcome_to_json(outcome: CallOutcome) -> Value {
    match outcome {
        CallOutcome::Result(result) => {
            json!({ "isError": result.is_error, "content": result.content })
        }
        CallOutcome::Delegation(delegation) => json!({
            "isError": false,
            "content": {
                "type": "oauth_delegation",
                "delegation": delegation,
            },
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolsListRequest {}

#[derive(Debug, Serialize)]
struct ToolsListResponse {
    tools: Vec<crate::router::AggregatedTool>,
}

pub async fn tools_list(State(container): State<Arc<Container>>) -> Json<Value> {
    let wiring = container.wiring().await;
    let tools = wiring.router.list_tools().await;
    Json(json!(ToolsListResponse { tools }))
}

#[derive(Debug, Deserialize)]
pub struct ToolsCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

pub async fn tools_call(
    State(container): State<Arc<Container>>,
    headers: HeaderMap,
    Json(req): Json<ToolsCallRequest>,
) -> (StatusCode, Json<Value>) {
    let wiring = container.wiring().await;
    let token = bearer_token(&headers);
    let outcome = wiring
        .router
        .call(
            CallToolRequest {
                name: req.name,
                arguments: req.arguments,
            },
            &token,
        )
        .await;
    (StatusCode::OK, Json(outcome_to_json(outcome)))
}

#[derive(Debug, Serialize)]
struct ResourcesListResponse {
    resources: Vec<crate::router::AggregatedResource>,
}

pub async fn resources_list(State(container): State<Arc<Container>>) -> Json<Value> {
    let wiring = container.wiring().await;
    let resources = wiring.router.list_resources().await;
    Json(json!(ResourcesListResponse { resources }))
}

#[derive(Debug, Deserialize)]
pub struct ResourcesReadRequest {
    pub uri: String,
}

pub async fn resources_read(
    State(container): State<Arc<Container>>,
    headers: HeaderMap,
    Json(req): Json<ResourcesReadRequest>,
) -> (StatusCode, Json<Value>) {
    let wiring = container.wiring().await;
    let token = bearer_token(&headers);
    let outcome = wiring
        .router
        .read(ReadResourceRequest { uri: req.uri }, &token)
        .await;
    (StatusCode::OK, Json(outcome_to_json(outcome)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_extracts_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer abc123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), "abc123");
    }

    #[test]
    fn missing_header_yields_empty_token() {
        assert_eq!(bearer_token(&HeaderMap::new()), "");
    }
}
