//! `GET /metrics` — Prometheus text exposition.
//!
//! Plain string formatting, no external metrics crate — the gateway only
//! needs to expose state that's already tracked elsewhere (circuit state,
//! health score) rather than maintain its own counters.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::circuit_breaker::CircuitState;
use crate::container::Container;
use crate::route_registry::RouteRegistry;

fn circuit_state_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

pub async fn metrics(State(container): State<Arc<Container>>) -> Response {
    let wiring = container.wiring().await;
    let snapshot = wiring.registry.snapshot().await;

    let mut body = String::new();
    let _ = writeln!(body, "# HELP mcp_gateway_uptime_seconds Process uptime in seconds.");
    let _ = writeln!(body, "# TYPE mcp_gateway_uptime_seconds counter");
    let _ = writeln!(body, "mcp_gateway_uptime_seconds {}", container.uptime_seconds());

    let _ = writeln!(
        body,
        "# HELP mcp_gateway_instance_circuit_state 0=closed 1=half_open 2=open"
    );
    let _ = writeln!(body, "# TYPE mcp_gateway_instance_circuit_state gauge");
    let _ = writeln!(body, "# HELP mcp_gateway_instance_health_score 0.0-100.0");
    let _ = writeln!(body, "# TYPE mcp_gateway_instance_health_score gauge");

    for (server_id, instances) in &snapshot {
        for instance in instances {
            let key = RouteRegistry::breaker_key(server_id, &instance.id);
            let state = wiring.breaker.state_of(&key).await;
            let _ = writeln!(
                body,
                "mcp_gateway_instance_circuit_state{{server=\"{server_id}\",instance=\"{}\"}} {}",
                instance.id,
                circuit_state_value(state)
            );
            let _ = writeln!(
                body,
                "mcp_gateway_instance_health_score{{server=\"{server_id}\",instance=\"{}\"}} {}",
                instance.id, instance.health_score
            );
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_state_encodes_ordinal() {
        assert_eq!(circuit_state_value(CircuitState::Closed), 0);
        assert_eq!(circuit_state_value(CircuitState::HalfOpen), 1);
        assert_eq!(circuit_state_value(CircuitState::Open), 2);
    }
}
