//! The gateway's own MCP front door plus the liveness/readiness/metrics/oauth
//! endpoints.

pub mod capabilities;
pub mod health;
pub mod mcp;
pub mod metrics;
pub mod oauth;
