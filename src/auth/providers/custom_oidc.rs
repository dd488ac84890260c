//! Custom OIDC provider adapter, configured entirely from
//! `ServerConfig.auth_config` rather than a hardcoded vendor — if `jwks_uri`
//! is set, tokens are verified as JWTs; otherwise they are treated as opaque
//! and accepted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{expires_at_from_seconds, OAuthProvider, TokenValidity, UserInfo};
use crate::error::GatewayError;
use crate::token_store::StoredToken;

#[derive(Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct OidcClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct GenericTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: String,
}

pub struct CustomOidcProvider {
    client: Client,
    client_id: String,
    client_secret: Option<String>,
    authorization_endpoint: String,
    token_endpoint: String,
    jwks_uri: Option<String>,
    userinfo_endpoint: Option<String>,
    issuer: Option<String>,
    jwks_cache: RwLock<Option<Vec<Jwk>>>,
}

pub struct CustomOidcConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub issuer: Option<String>,
}

impl CustomOidcProvider {
    pub fn new(client: Client, config: CustomOidcConfig) -> Self {
        Self {
            client,
            client_id: config.client_id,
            client_secret: config.client_secret,
            authorization_endpoint: config.authorization_endpoint,
            token_endpoint: config.token_endpoint,
            jwks_uri: config.jwks_uri,
            userinfo_endpoint: config.userinfo_endpoint,
            issuer: config.issuer,
            jwks_cache: RwLock::new(None),
        }
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<(), GatewayError> {
        let resp = self
            .client
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let parsed: JwksResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        *self.jwks_cache.write().await = Some(parsed.keys);
        Ok(())
    }

    async fn decoding_key_for(&self, jwks_uri: &str, kid: &str) -> Result<DecodingKey, GatewayError> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(keys) = cache.as_ref() {
                if let Some(jwk) = keys.iter().find(|k| k.kid == kid) {
                    return build_rsa_key(jwk);
                }
            }
        }
        self.fetch_jwks(jwks_uri).await?;
        let cache = self.jwks_cache.read().await;
        let keys = cache.as_ref().ok_or(GatewayError::InvalidClientToken)?;
        let jwk = keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or(GatewayError::InvalidClientToken)?;
        build_rsa_key(jwk)
    }
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

#[async_trait::async_trait]
impl OAuthProvider for CustomOidcProvider {
    fn name(&self) -> &'static str {
        "custom_oidc"
    }

    fn authorization_endpoint(&self) -> &str {
        &self.authorization_endpoint
    }

    fn token_endpoint(&self) -> &str {
        &self.token_endpoint
    }

    async fn validate_token(&self, access_token: &str) -> Result<TokenValidity, GatewayError> {
        let Some(jwks_uri) = &self.jwks_uri else {
            // No jwks_uri configured: treat as opaque and accept.
            return Ok(TokenValidity::Valid);
        };

        let header = match decode_header(access_token) {
            Ok(h) => h,
            Err(_) => return Ok(TokenValidity::Invalid),
        };
        let Some(kid) = header.kid else {
            return Ok(TokenValidity::Invalid);
        };
        let key = match self.decoding_key_for(jwks_uri, &kid).await {
            Ok(k) => k,
            Err(_) => return Ok(TokenValidity::Invalid),
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.client_id.clone()]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer.clone()]);
        }

        match decode::<OidcClaims>(access_token, &key, &validation) {
            Ok(_) => Ok(TokenValidity::Valid),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Ok(TokenValidity::Expired),
                _ => Ok(TokenValidity::Invalid),
            },
        }
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<StoredToken, GatewayError> {
        let mut form = vec![
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let resp = self
            .client
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::RefreshFailed(format!(
                "custom_oidc refresh returned {}",
                resp.status()
            )));
        }

        let parsed: GenericTokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        Ok(StoredToken {
            provider: self.name().to_string(),
            subject: String::new(),
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token.or(Some(refresh_token.to_string())),
            expires_at: Some(expires_at_from_seconds(parsed.expires_in)),
            scope: Some(parsed.scope),
        })
    }

    async fn get_user_info(&self, access_token: &str) -> Result<UserInfo, GatewayError> {
        let Some(userinfo_endpoint) = &self.userinfo_endpoint else {
            return Err(GatewayError::RefreshFailed(
                "no userinfo_endpoint configured".to_string(),
            ));
        };

        let resp = self
            .client
            .get(userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::RefreshFailed(format!(
                "custom_oidc userinfo returned {}",
                resp.status()
            )));
        }

        let claims: OidcClaims = resp
            .json()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        Ok(UserInfo {
            subject: claims.sub,
            email: claims.email,
            scopes: Vec::new(),
        })
    }
}
