//! Per-backend auth strategy dispatch, delegation issuance, and client-token
//! validation.

pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::GatewayError;
use crate::token_store::{SharedTokenStore, StoredToken};
use providers::OAuthProvider;

const REFRESH_SKEW: ChronoDuration = ChronoDuration::seconds(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategy {
    MasterOauth,
    DelegateOauth,
    BypassAuth,
    ProxyOauth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFallback {
    /// Pass the master token through when refresh fails or no token is on
    /// file.
    Passthrough,
    Fail,
}

#[derive(Debug, Clone)]
pub struct ServerAuthConfig {
    pub strategy: AuthStrategy,
    pub provider: Option<String>,
    pub required_scopes: Vec<String>,
    pub client_id: Option<String>,
    pub proxy_fallback: ProxyFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Delegation {
    pub auth_endpoint: String,
    pub token_endpoint: String,
    pub client_info: ClientInfo,
    pub required_scopes: Vec<String>,
    pub redirect_after_auth: bool,
}

pub enum PreparedAuth {
    Headers(HashMap<String, String>),
    Delegation(Delegation),
}

struct MasterJwks {
    jwks_uri: String,
    audience: String,
    issuer: Option<String>,
    client: reqwest::Client,
    cache: RwLock<Option<Vec<Jwk>>>,
}

#[derive(Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Deserialize)]
struct JwksDoc {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct MasterClaims {
    #[allow(dead_code)]
    sub: Option<String>,
}

pub struct MultiAuthManager {
    configs: RwLock<HashMap<String, ServerAuthConfig>>,
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
    token_store: SharedTokenStore,
    master_jwks: Option<MasterJwks>,
    pending_delegations: RwLock<HashMap<(String, String), Delegation>>,
}

impl MultiAuthManager {
    pub fn new(
        providers: HashMap<String, Arc<dyn OAuthProvider>>,
        token_store: SharedTokenStore,
        master_jwks_uri: Option<String>,
        master_audience: String,
        master_issuer: Option<String>,
    ) -> Self {
        let master_jwks = master_jwks_uri.map(|jwks_uri| MasterJwks {
            jwks_uri,
            audience: master_audience,
            issuer: master_issuer,
            client: reqwest::Client::new(),
            cache: RwLock::new(None),
        });

        Self {
            configs: RwLock::new(HashMap::new()),
            providers,
            token_store,
            master_jwks,
            pending_delegations: RwLock::new(HashMap::new()),
        }
    }

    pub async fn update_configs(&self, configs: HashMap<String, ServerAuthConfig>) {
        *self.configs.write().await = configs;
    }

    fn token_key(server_id: &str, client_token: &str) -> String {
        let prefix: String = client_token.chars().take(16).collect();
        format!("{server_id}::{prefix}")
    }

    /// Validates an inbound client token: if JWKS is configured, verify
    /// signature/issuer/audience and reject on failure; otherwise accept
    /// opaque tokens, enforcing `exp > now` only if the token happens to
    /// parse as a JWT.
    pub async fn validate_client_token(&self, token: &str) -> Result<(), GatewayError> {
        let Some(jwks) = &self.master_jwks else {
            if let Some(exp) = unverified_jwt_exp(token) {
                if exp <= Utc::now().timestamp() {
                    return Err(GatewayError::InvalidClientToken);
                }
            }
            return Ok(());
        };

        let header = decode_header(token).map_err(|_| GatewayError::InvalidClientToken)?;
        let kid = header.kid.ok_or(GatewayError::InvalidClientToken)?;
        let key = self.master_decoding_key(jwks, &kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[jwks.audience.clone()]);
        if let Some(issuer) = &jwks.issuer {
            validation.set_issuer(&[issuer.clone()]);
        }

        decode::<MasterClaims>(token, &key, &validation)
            .map(|_| ())
            .map_err(|_| GatewayError::InvalidClientToken)
    }

    async fn master_decoding_key(
        &self,
        jwks: &MasterJwks,
        kid: &str,
    ) -> Result<DecodingKey, GatewayError> {
        {
            let cache = jwks.cache.read().await;
            if let Some(keys) = cache.as_ref() {
                if let Some(jwk) = keys.iter().find(|k| k.kid == kid) {
                    return build_rsa_key(jwk);
                }
            }
        }
        let resp = jwks
            .client
            .get(&jwks.jwks_uri)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let doc: JwksDoc = resp
            .json()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        *jwks.cache.write().await = Some(doc.keys);

        let cache = jwks.cache.read().await;
        let keys = cache.as_ref().ok_or(GatewayError::InvalidClientToken)?;
        let jwk = keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or(GatewayError::InvalidClientToken)?;
        build_rsa_key(jwk)
    }

    /// The OAuth provider name configured for `server_id`, if any.
    pub async fn provider_for_server(&self, server_id: &str) -> Option<String> {
        self.configs.read().await.get(server_id)?.provider.clone()
    }

    /// Builds the outbound auth headers for one backend call, dispatching on
    /// the server's configured strategy.
    pub async fn prepare_headers(
        &self,
        server_id: &str,
        client_token: &str,
    ) -> Result<PreparedAuth, GatewayError> {
        let config = {
            let configs = self.configs.read().await;
            configs
                .get(server_id)
                .cloned()
                .ok_or_else(|| GatewayError::NoRoute(server_id.to_string()))?
        };

        match config.strategy {
            AuthStrategy::BypassAuth => Ok(PreparedAuth::Headers(HashMap::new())),

            AuthStrategy::MasterOauth => {
                self.validate_client_token(client_token).await?;
                let mut headers = HashMap::new();
                headers.insert("Authorization".to_string(), format!("Bearer {client_token}"));
                Ok(PreparedAuth::Headers(headers))
            }

            AuthStrategy::DelegateOauth => {
                let provider_name = config.provider.as_deref().unwrap_or_default();
                let provider = self
                    .providers
                    .get(provider_name)
                    .ok_or_else(|| GatewayError::RefreshFailed("unknown provider".to_string()))?;

                let state = crate::oauth_flow::generate_state();
                let delegation = Delegation {
                    auth_endpoint: provider.authorization_endpoint().to_string(),
                    token_endpoint: provider.token_endpoint().to_string(),
                    client_info: ClientInfo {
                        client_id: config.client_id.clone().unwrap_or_default(),
                        state: state.clone(),
                    },
                    required_scopes: config.required_scopes.clone(),
                    redirect_after_auth: true,
                };

                self.pending_delegations.write().await.insert(
                    (client_token.to_string(), server_id.to_string()),
                    delegation.clone(),
                );

                Ok(PreparedAuth::Delegation(delegation))
            }

            AuthStrategy::ProxyOauth => {
                let key = Self::token_key(server_id, client_token);
                let provider_name = config.provider.as_deref().unwrap_or_default();
                let provider = self.providers.get(provider_name);

                let stored = self
                    .token_store
                    .get(provider_name, &key)
                    .await?;

                if let Some(token) = &stored {
                    let fresh_enough = token
                        .expires_at
                        .map(|exp| exp > Utc::now() + REFRESH_SKEW)
                        .unwrap_or(true);
                    if fresh_enough {
                        let mut headers = HashMap::new();
                        headers.insert(
                            "Authorization".to_string(),
                            format!("Bearer {}", token.access_token),
                        );
                        return Ok(PreparedAuth::Headers(headers));
                    }
                }

                if let (Some(token), Some(provider)) = (&stored, provider) {
                    if let Some(refresh_token) = &token.refresh_token {
                        match provider.refresh_token(refresh_token).await {
                            Ok(mut refreshed) => {
                                refreshed.subject = key.clone();
                                self.token_store.put(refreshed.clone()).await?;
                                let mut headers = HashMap::new();
                                headers.insert(
                                    "Authorization".to_string(),
                                    format!("Bearer {}", refreshed.access_token),
                                );
                                return Ok(PreparedAuth::Headers(headers));
                            }
                            Err(e) => {
                                tracing::warn!(
                                    server_id = %server_id,
                                    error = %e,
                                    "proxy_oauth refresh failed"
                                );
                            }
                        }
                    }
                }

                match config.proxy_fallback {
                    ProxyFallback::Passthrough => {
                        tracing::warn!(server_id = %server_id, "proxy_oauth degraded: falling back to master token passthrough");
                        let mut headers = HashMap::new();
                        headers.insert("Authorization".to_string(), format!("Bearer {client_token}"));
                        Ok(PreparedAuth::Headers(headers))
                    }
                    ProxyFallback::Fail => Err(GatewayError::RefreshFailed(
                        "proxy_oauth has no usable token and fallback is disabled".to_string(),
                    )),
                }
            }
        }
    }

    /// Called by the Flow Controller once a delegated OAuth flow completes,
    /// to bind the issued token under the same `(clientToken, serverID)`
    /// key `ProxyOauth` would later look up.
    pub async fn store_delegated_token(
        &self,
        server_id: &str,
        client_token: &str,
        provider_name: &str,
        token: StoredToken,
    ) -> Result<(), GatewayError> {
        let key = Self::token_key(server_id, client_token);
        let mut stored = token;
        stored.subject = key;
        stored.provider = provider_name.to_string();
        self.token_store.put(stored).await?;
        self.pending_delegations
            .write()
            .await
            .remove(&(client_token.to_string(), server_id.to_string()));
        Ok(())
    }
}

/// Reads the `exp` claim out of a JWT's payload segment without verifying
/// its signature — used only to still honor `exp` on an otherwise-opaque
/// token that happens to be JWT-shaped. Returns `None` if the token isn't
/// JWT-shaped or the payload has no `exp`.
fn unverified_jwt_exp(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    if parts.next().is_none() {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp").and_then(|v| v.as_i64())
}

fn build_rsa_key(jwk: &Jwk) -> Result<DecodingKey, GatewayError> {
    let n = URL_SAFE_NO_PAD
        .decode(&jwk.n)
        .map_err(|_| GatewayError::InvalidClientToken)?;
    let e = URL_SAFE_NO_PAD
        .decode(&jwk.e)
        .map_err(|_| GatewayError::InvalidClientToken)?;
    Ok(DecodingKey::from_rsa_raw_components(&n, &e))
}
