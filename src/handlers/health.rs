//! `GET /health` and `GET /health/ready` — liveness and readiness.
//!
//! Liveness never fails as long as the process is up; readiness gates on
//! whether every configured server has at least one instance known to the
//! Route Registry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::circuit_breaker::CircuitState;
use crate::container::Container;
use crate::route_registry::RouteRegistry;

async fn server_health(container: &Container) -> (bool, Value) {
    let wiring = container.wiring().await;
    let snapshot = wiring.registry.snapshot().await;

    let mut all_ok = true;
    let mut servers = serde_json::Map::new();
    for (server_id, instances) in &snapshot {
        let mut instance_states = Vec::with_capacity(instances.len());
        let mut server_ok = false;
        for instance in instances {
            let key = RouteRegistry::breaker_key(server_id, &instance.id);
            let state = wiring.breaker.state_of(&key).await;
            let up = state != CircuitState::Open;
            server_ok |= up;
            instance_states.push(json!({
                "id": instance.id,
                "circuit_state": format!("{state:?}"),
                "health_score": instance.health_score,
            }));
        }
        all_ok &= server_ok || instances.is_empty();
        servers.insert(
            server_id.clone(),
            json!({ "ok": server_ok || instances.is_empty(), "instances": instance_states }),
        );
    }

    (all_ok, Value::Object(servers))
}

/// `GET /health`: liveness only, never fails as long as the process is
/// serving requests at all.
pub async fn health(State(container): State<Arc<Container>>) -> Json<Value> {
    let (ok, servers) = server_health(&container).await;
    Json(json!({
        "ok": ok,
        "servers": servers,
        "uptime_seconds": container.uptime_seconds(),
    }))
}

/// `GET /health/ready`: 200 only once every configured server resolved at
/// least one instance with an open circuit path, 503 otherwise so a load
/// balancer can hold traffic during startup.
pub async fn ready(State(container): State<Arc<Container>>) -> (StatusCode, Json<Value>) {
    let (ok, servers) = server_health(&container).await;
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": ok,
            "servers": servers,
            "uptime_seconds": container.uptime_seconds(),
        })),
    )
}
