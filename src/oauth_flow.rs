//! The browser-facing `/oauth/authorize` → `/oauth/callback` dance that
//! backs `delegate_oauth` (and, optionally, `proxy_oauth` bootstrapping).
//!
//! PKCE-S256 plus a `state` CSRF token, dispatched per provider. The code
//! verifier never leaves the server: in-flight flows are keyed by `state` in
//! a map rather than a single slot, so concurrent flows from different
//! clients don't clobber each other. `state` is bound to an
//! HttpOnly/Secure/SameSite=Lax cookie and must match both the cookie and
//! the query string, and every flow entry is consumed exactly once
//! (delete-on-read) with a 10 minute TTL.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::auth::providers::{parse_token_response, OAuthProvider};
use crate::auth::MultiAuthManager;
use crate::crypto::constant_time_eq;
use crate::error::GatewayError;
use crate::token_store::StoredToken;

const STATE_COOKIE: &str = "mcp_oauth_state";
const FLOW_TTL: ChronoDuration = ChronoDuration::minutes(10);

#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
    pub method: &'static str,
}

/// One entry per in-flight authorize→callback round trip, keyed by `state`
/// and never serialized to the client.
#[derive(Debug, Clone)]
struct FlowData {
    provider: String,
    server_id: Option<String>,
    return_to: Option<String>,
    code_verifier: String,
    client_binding: Option<String>,
    created_at: DateTime<Utc>,
}

pub struct AuthorizeRequest {
    pub provider: String,
    pub server_id: Option<String>,
    pub return_to: Option<String>,
    /// Identifies the caller across the authorize/callback round trip so
    /// the issued token can be bound to the right `(clientToken, serverID)`
    /// pair in the token store. Opaque to this module.
    pub client_binding: Option<String>,
}

pub struct AuthorizeOutcome {
    pub redirect_url: String,
    /// `Set-Cookie` header value binding `state` to the browser.
    pub state_cookie: String,
}

pub struct CallbackRequest {
    pub code: String,
    pub state: String,
    /// The `state` value read back from the request's cookie jar. Must
    /// match `state` exactly — both the cookie and the query parameter
    /// are required to agree.
    pub cookie_state: Option<String>,
}

pub struct CallbackOutcome {
    pub redirect_to: String,
    /// `Set-Cookie` header value that clears the state cookie.
    pub clear_cookie: String,
}

/// 256 bits of randomness, base64url-encoded — comfortably over the
/// spec's 128-bit minimum for `state` and PKCE verifiers alike.
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_state() -> String {
    random_token()
}

fn generate_pkce() -> PkcePair {
    let verifier = random_token();
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    PkcePair {
        verifier,
        challenge,
        method: "S256",
    }
}

fn set_cookie(name: &str, value: &str, max_age_secs: i64) -> String {
    format!(
        "{name}={value}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={max_age_secs}"
    )
}

fn clear_cookie_header(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0")
}

/// Rejects protocol-relative (`//evil.com`) and absolute cross-origin
/// URLs; accepts plain relative paths or URLs that parse with a host
/// matching `base_url`.
fn validate_return_to(return_to: &str, base_url: &str) -> Result<(), GatewayError> {
    if return_to.starts_with("//") {
        return Err(GatewayError::InvalidState);
    }
    if return_to.starts_with('/') {
        return Ok(());
    }
    let parsed = url::Url::parse(return_to).map_err(|_| GatewayError::InvalidState)?;
    let base = url::Url::parse(base_url).map_err(|_| GatewayError::InvalidState)?;
    if parsed.host_str() == base.host_str() && parsed.scheme() == base.scheme() {
        Ok(())
    } else {
        Err(GatewayError::InvalidState)
    }
}

fn require_https(endpoint: &str, allow_insecure_http: bool) -> Result<(), GatewayError> {
    if allow_insecure_http || endpoint.starts_with("https://") {
        Ok(())
    } else {
        Err(GatewayError::ConfigSchema(format!(
            "refusing to use non-https oauth endpoint: {endpoint}"
        )))
    }
}

pub struct OAuthFlowController {
    flows: RwLock<HashMap<String, FlowData>>,
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
    auth_manager: Arc<MultiAuthManager>,
    http_client: reqwest::Client,
    /// Configured externally-visible base URL (`MASTER_BASE_URL`), used to
    /// compute `redirect_uri` instead of trusting the inbound `Host`
    /// header.
    base_url: String,
    allow_insecure_http: bool,
}

impl OAuthFlowController {
    pub fn new(
        providers: HashMap<String, Arc<dyn OAuthProvider>>,
        auth_manager: Arc<MultiAuthManager>,
        base_url: String,
        allow_insecure_http: bool,
    ) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            providers,
            auth_manager,
            http_client: reqwest::Client::new(),
            base_url,
            allow_insecure_http,
        }
    }

    fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.base_url.trim_end_matches('/'))
    }

    pub async fn authorize(&self, req: AuthorizeRequest) -> Result<AuthorizeOutcome, GatewayError> {
        if let Some(return_to) = &req.return_to {
            validate_return_to(return_to, &self.base_url)?;
        }

        let provider = self
            .providers
            .get(&req.provider)
            .ok_or_else(|| GatewayError::RefreshFailed(format!("unknown provider '{}'", req.provider)))?;

        require_https(provider.authorization_endpoint(), self.allow_insecure_http)?;

        let state = generate_state();
        let pkce = generate_pkce();

        let flow = FlowData {
            provider: req.provider.clone(),
            server_id: req.server_id,
            return_to: req.return_to,
            code_verifier: pkce.verifier,
            client_binding: req.client_binding,
            created_at: Utc::now(),
        };
        self.flows.write().await.insert(state.clone(), flow);

        let mut url = url::Url::parse(provider.authorization_endpoint())
            .map_err(|e| GatewayError::ConfigSchema(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri())
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", pkce.method)
            .append_pair("state", &state);

        Ok(AuthorizeOutcome {
            redirect_url: url.to_string(),
            state_cookie: set_cookie(STATE_COOKIE, &state, FLOW_TTL.num_seconds()),
        })
    }

    /// Removes and returns the flow for `state`, enforcing single-use
    /// consumption and the 10 minute TTL.
    async fn consume_flow(&self, state: &str) -> Result<FlowData, GatewayError> {
        let flow = self
            .flows
            .write()
            .await
            .remove(state)
            .ok_or(GatewayError::InvalidState)?;

        if Utc::now() - flow.created_at > FLOW_TTL {
            return Err(GatewayError::InvalidState);
        }
        Ok(flow)
    }

    pub async fn callback(&self, req: CallbackRequest) -> Result<CallbackOutcome, GatewayError> {
        match &req.cookie_state {
            Some(cookie_state) if constant_time_eq(cookie_state, &req.state) => {}
            _ => return Err(GatewayError::InvalidState),
        }

        let flow = self.consume_flow(&req.state).await?;

        let provider = self
            .providers
            .get(&flow.provider)
            .ok_or(GatewayError::InvalidState)?;

        require_https(provider.token_endpoint(), self.allow_insecure_http)?;

        let form = [
            ("grant_type", "authorization_code"),
            ("code", req.code.as_str()),
            ("redirect_uri", self.redirect_uri().as_str()),
            ("code_verifier", flow.code_verifier.as_str()),
        ];

        let resp = self
            .http_client
            .post(provider.token_endpoint())
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::HttpStatus(resp.status().as_u16()));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let parsed = parse_token_response(&body, content_type.as_deref())?;

        let access_token = parsed
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::RefreshFailed("token response missing access_token".to_string()))?
            .to_string();
        let refresh_token = parsed
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let expires_in = parsed.get("expires_in").and_then(|v| v.as_u64());
        let scope = parsed
            .get("scope")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let token = StoredToken {
            provider: flow.provider.clone(),
            subject: String::new(),
            access_token,
            refresh_token,
            expires_at: Some(crate::auth::providers::expires_at_from_seconds(expires_in)),
            scope,
        };

        let server_id = flow.server_id.clone().unwrap_or_default();
        let client_binding = flow.client_binding.clone().unwrap_or_default();
        self.auth_manager
            .store_delegated_token(&server_id, &client_binding, &flow.provider, token)
            .await?;

        Ok(CallbackOutcome {
            redirect_to: flow.return_to.unwrap_or_else(|| "/".to_string()),
            clear_cookie: clear_cookie_header(STATE_COOKIE),
        })
    }

    /// Removes expired, never-completed flows. Driven by the container's
    /// once-a-minute sweep alongside the token store's.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut flows = self.flows.write().await;
        let before = flows.len();
        flows.retain(|_, flow| now - flow.created_at <= FLOW_TTL);
        before - flows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::providers::github::GitHubProvider;
    use crate::token_store::in_memory_for_tests;

    fn manager() -> Arc<MultiAuthManager> {
        Arc::new(MultiAuthManager::new(
            HashMap::new(),
            in_memory_for_tests(),
            None,
            "aud".to_string(),
            None,
        ))
    }

    fn providers() -> HashMap<String, Arc<dyn OAuthProvider>> {
        let mut map: HashMap<String, Arc<dyn OAuthProvider>> = HashMap::new();
        map.insert(
            "github".to_string(),
            Arc::new(GitHubProvider::new(
                reqwest::Client::new(),
                "client-id".to_string(),
                "client-secret".to_string(),
            )),
        );
        map
    }

    #[test]
    fn generated_state_has_enough_entropy() {
        let state = generate_state();
        // base64url of 32 raw bytes is 43 chars with no padding.
        assert_eq!(state.len(), 43);
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let pkce = generate_pkce();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
        assert_eq!(pkce.method, "S256");
    }

    #[test]
    fn relative_return_to_is_accepted() {
        assert!(validate_return_to("/dashboard", "https://gateway.example.com").is_ok());
    }

    #[test]
    fn protocol_relative_return_to_is_rejected() {
        assert!(validate_return_to("//evil.example.com/steal", "https://gateway.example.com").is_err());
    }

    #[test]
    fn cross_origin_absolute_return_to_is_rejected() {
        assert!(validate_return_to("https://evil.example.com/", "https://gateway.example.com").is_err());
    }

    #[tokio::test]
    async fn authorize_issues_a_single_use_flow_bound_to_state() {
        let controller = OAuthFlowController::new(
            providers(),
            manager(),
            "https://gateway.example.com".to_string(),
            false,
        );
        let outcome = controller
            .authorize(AuthorizeRequest {
                provider: "github".to_string(),
                server_id: Some("srv".to_string()),
                return_to: Some("/done".to_string()),
                client_binding: Some("client-token".to_string()),
            })
            .await
            .unwrap();

        assert!(outcome.redirect_url.contains("code_challenge_method=S256"));
        assert!(outcome.state_cookie.contains("HttpOnly"));
        assert_eq!(controller.flows.read().await.len(), 1);
    }

    #[tokio::test]
    async fn callback_rejects_state_cookie_mismatch() {
        let controller = OAuthFlowController::new(
            providers(),
            manager(),
            "https://gateway.example.com".to_string(),
            false,
        );
        let outcome = controller
            .authorize(AuthorizeRequest {
                provider: "github".to_string(),
                server_id: None,
                return_to: None,
                client_binding: None,
            })
            .await
            .unwrap();

        // extract state from the redirect url for the test
        let state = url::Url::parse(&outcome.redirect_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .unwrap()
            .1
            .to_string();

        let result = controller
            .callback(CallbackRequest {
                code: "irrelevant".to_string(),
                state,
                cookie_state: Some("a-different-state".to_string()),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidState)));
    }

    #[tokio::test]
    async fn callback_rejects_unknown_state_as_expired_or_reused() {
        let controller = OAuthFlowController::new(
            providers(),
            manager(),
            "https://gateway.example.com".to_string(),
            false,
        );
        let result = controller
            .callback(CallbackRequest {
                code: "irrelevant".to_string(),
                state: "never-issued".to_string(),
                cookie_state: Some("never-issued".to_string()),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidState)));
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_flows_only() {
        let controller = OAuthFlowController::new(
            providers(),
            manager(),
            "https://gateway.example.com".to_string(),
            false,
        );
        controller.flows.write().await.insert(
            "stale".to_string(),
            FlowData {
                provider: "github".to_string(),
                server_id: None,
                return_to: None,
                code_verifier: "v".to_string(),
                client_binding: None,
                created_at: Utc::now() - ChronoDuration::minutes(11),
            },
        );
        controller.flows.write().await.insert(
            "fresh".to_string(),
            FlowData {
                provider: "github".to_string(),
                server_id: None,
                return_to: None,
                code_verifier: "v".to_string(),
                client_binding: None,
                created_at: Utc::now(),
            },
        );

        let removed = controller.sweep_expired().await;
        assert_eq!(removed, 1);
        assert_eq!(controller.flows.read().await.len(), 1);
        assert!(controller.flows.read().await.contains_key("fresh"));
    }

    #[test]
    fn insecure_http_endpoint_rejected_without_dev_flag() {
        assert!(require_https("http://example.com/authorize", false).is_err());
        assert!(require_https("http://example.com/authorize", true).is_ok());
        assert!(require_https("https://example.com/authorize", false).is_ok());
    }
}
