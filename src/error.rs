//! Gateway-wide error taxonomy.
//!
//! Every error carries a stable `code` (used in API responses and logs) and
//! a `category` used by the retry engine and circuit breaker to decide
//! whether to retry, surface, or count as a failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Auth,
    Routing,
    Transport,
    Config,
    Crypto,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid tool name: {0}")]
    InvalidToolName(String),
    #[error("invalid resource uri: {0}")]
    InvalidUri(String),
    #[error("invalid oauth state")]
    InvalidState,

    #[error("invalid client token")]
    InvalidClientToken,
    #[error("oauth token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("no route for '{0}'")]
    NoRoute(String),
    #[error("no healthy instance for server '{0}'")]
    NoHealthyInstance(String),
    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("backend returned {0}")]
    HttpStatus(u16),

    #[error("config schema error: {0}")]
    ConfigSchema(String),
    #[error("missing secret: {0}")]
    SecretMissing(String),
    #[error("config dependency cycle: {0}")]
    ConfigCycle(String),

    #[error("corrupt ciphertext")]
    CorruptCiphertext,
    #[error("encryption key missing")]
    KeyMissing,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToolName(_) => "invalid_tool_name",
            Self::InvalidUri(_) => "invalid_uri",
            Self::InvalidState => "invalid_state",
            Self::InvalidClientToken => "invalid_client_token",
            Self::RefreshFailed(_) => "refresh_failed",
            Self::NoRoute(_) => "no_route",
            Self::NoHealthyInstance(_) => "no_healthy_instance",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::HttpStatus(status) if *status == 429 => "http_429",
            Self::HttpStatus(_) => "http_5xx",
            Self::ConfigSchema(_) => "schema",
            Self::SecretMissing(_) => "secret_missing",
            Self::ConfigCycle(_) => "cycle",
            Self::CorruptCiphertext => "corrupt_ciphertext",
            Self::KeyMissing => "key_missing",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidToolName(_) | Self::InvalidUri(_) | Self::InvalidState => {
                ErrorCategory::Validation
            }
            Self::InvalidClientToken | Self::RefreshFailed(_) => ErrorCategory::Auth,
            Self::NoRoute(_) | Self::NoHealthyInstance(_) | Self::CircuitOpen { .. } => {
                ErrorCategory::Routing
            }
            Self::Timeout | Self::Network(_) | Self::HttpStatus(_) => ErrorCategory::Transport,
            Self::ConfigSchema(_) | Self::SecretMissing(_) | Self::ConfigCycle(_) => {
                ErrorCategory::Config
            }
            Self::CorruptCiphertext | Self::KeyMissing => ErrorCategory::Crypto,
        }
    }

    /// Whether the retry engine is allowed to retry this error. Only
    /// `Transport`-classified errors are retriable, and only a subset of
    /// those — see `retry::is_retryable_status` for HTTP status codes.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transport)
    }
}

/// Structured, user-safe error body. Never includes secrets — callers must
/// not embed raw backend bodies or headers into `detail`.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let status = match self.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Auth => StatusCode::UNAUTHORIZED,
            ErrorCategory::Routing => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Transport => StatusCode::BAD_GATEWAY,
            ErrorCategory::Config => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCategory::Crypto => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "isError": true,
            "content": {
                "error": self.code(),
                "message": self.to_string(),
            },
            "correlation_id": correlation_id,
        });

        if let Self::CircuitOpen { retry_after_ms } = &self {
            body["content"]["retryAfterMs"] = json!(retry_after_ms);
        }

        tracing::warn!(
            code = self.code(),
            correlation_id = %correlation_id,
            "gateway error: {}",
            crate::logging::redact(&self.to_string())
        );

        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
