//! Per-vendor token validation, refresh, and userinfo lookup, dispatched
//! through a single trait object so the Multi-Auth Manager and Flow
//! Controller never need to match on provider name.

pub mod custom_oidc;
pub mod github;
pub mod google;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::token_store::StoredToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub subject: String,
    pub email: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenValidity {
    Valid,
    Expired,
    Invalid,
}

#[async_trait::async_trait]
pub trait OAuthProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn authorization_endpoint(&self) -> &str;
    fn token_endpoint(&self) -> &str;

    async fn validate_token(&self, access_token: &str) -> Result<TokenValidity, GatewayError>;
    async fn refresh_token(&self, refresh_token: &str) -> Result<StoredToken, GatewayError>;
    async fn get_user_info(&self, access_token: &str) -> Result<UserInfo, GatewayError>;
}

/// `expires_at = now + expires_in` (default 3600s when `expires_in` is
/// absent from the token response).
pub fn expires_at_from_seconds(expires_in: Option<u64>) -> DateTime<Utc> {
    let seconds = expires_in.unwrap_or(3600);
    Utc::now() + chrono::Duration::seconds(seconds as i64)
}

/// Token endpoint responses may be JSON or form-encoded; this parses either
/// into a generic map so callers can pull out standard OAuth2 fields
/// regardless of `Content-Type`.
pub fn parse_token_response(
    body: &str,
    content_type: Option<&str>,
) -> Result<serde_json::Value, GatewayError> {
    let looks_like_form = content_type
        .map(|ct| ct.contains("x-www-form-urlencoded"))
        .unwrap_or(false)
        || (!body.trim_start().starts_with('{') && body.contains('='));

    if looks_like_form {
        let mut map = serde_json::Map::new();
        for pair in body.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                let key = urlencoding_decode(key);
                let value = urlencoding_decode(value);
                map.insert(key, serde_json::Value::String(value));
            }
        }
        Ok(serde_json::Value::Object(map))
    } else {
        serde_json::from_str(body).map_err(|e| GatewayError::RefreshFailed(e.to_string()))
    }
}

fn urlencoding_decode(input: &str) -> String {
    percent_decode(input.replace('+', " ").as_bytes())
}

fn percent_decode(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
