//! `GET /capabilities` — the gateway's own aggregated catalog, in the same
//! shape backends are expected to serve at their own `/capabilities`, so the
//! gateway can itself be chained behind another aggregator.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::container::Container;

pub async fn capabilities(State(container): State<Arc<Container>>) -> Json<Value> {
    let wiring = container.wiring().await;
    let tools = wiring.router.list_tools().await;
    let resources = wiring.router.list_resources().await;
    // Prompt aggregation is not implemented: the external interface never
    // defines a prompts/call operation, only this optional listing field.
    Json(json!({
        "tools": tools,
        "resources": resources,
        "prompts": [],
    }))
}
