//! Google provider adapter — OIDC JWT validation with a userinfo fallback
//! for opaque access tokens.
//!
//! ID tokens are verified against Google's published JWKS with issuer
//! `accounts.google.com`/`https://accounts.google.com` and audience equal to
//! the configured `client_id`; anything that doesn't parse as a JWT falls
//! back to `GET https://openidconnect.googleapis.com/v1/userinfo`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{expires_at_from_seconds, OAuthProvider, TokenValidity, UserInfo};
use crate::error::GatewayError;
use crate::token_store::StoredToken;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const VALID_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

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
struct GoogleClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: String,
}

pub struct GoogleProvider {
    client: Client,
    client_id: String,
    client_secret: String,
    jwks_cache: RwLock<Option<Vec<Jwk>>>,
}

impl GoogleProvider {
    pub fn new(client: Client, client_id: String, client_secret: String) -> Self {
        Self {
            client,
            client_id,
            client_secret,
            jwks_cache: RwLock::new(None),
        }
    }

    async fn fetch_jwks(&self) -> Result<(), GatewayError> {
        let resp = self
            .client
            .get(JWKS_URL)
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

    async fn decoding_key_for(&self, kid: &str) -> Result<DecodingKey, GatewayError> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(keys) = cache.as_ref() {
                if let Some(jwk) = keys.iter().find(|k| k.kid == kid) {
                    return build_rsa_key(jwk);
                }
            }
        }
        self.fetch_jwks().await?;
        let cache = self.jwks_cache.read().await;
        let keys = cache.as_ref().ok_or(GatewayError::InvalidClientToken)?;
        let jwk = keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or(GatewayError::InvalidClientToken)?;
        build_rsa_key(jwk)
    }

    fn is_jwt_shaped(token: &str) -> bool {
        token.split('.').count() == 3
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
impl OAuthProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn authorization_endpoint(&self) -> &str {
        AUTHORIZE_URL
    }

    fn token_endpoint(&self) -> &str {
        TOKEN_URL
    }

    async fn validate_token(&self, access_token: &str) -> Result<TokenValidity, GatewayError> {
        if !Self::is_jwt_shaped(access_token) {
            // Opaque access token: fall back to the userinfo endpoint.
            return match self.get_user_info(access_token).await {
                Ok(_) => Ok(TokenValidity::Valid),
                Err(_) => Ok(TokenValidity::Invalid),
            };
        }

        let header = match decode_header(access_token) {
            Ok(h) => h,
            Err(_) => return Ok(TokenValidity::Invalid),
        };
        let Some(kid) = header.kid else {
            return Ok(TokenValidity::Invalid);
        };
        let key = match self.decoding_key_for(&kid).await {
            Ok(k) => k,
            Err(_) => return Ok(TokenValidity::Invalid),
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.client_id.clone()]);
        validation.set_issuer(&VALID_ISSUERS);

        match decode::<GoogleClaims>(access_token, &key, &validation) {
            Ok(_) => Ok(TokenValidity::Valid),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Ok(TokenValidity::Expired),
                _ => Ok(TokenValidity::Invalid),
            },
        }
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<StoredToken, GatewayError> {
        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::RefreshFailed(format!(
                "google refresh returned {}",
                resp.status()
            )));
        }

        let parsed: GoogleTokenResponse = resp
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
        let resp = self
            .client
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::RefreshFailed(format!(
                "google userinfo returned {}",
                resp.status()
            )));
        }

        let claims: GoogleClaims = resp
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_jwt_shape() {
        assert!(GoogleProvider::is_jwt_shaped("a.b.c"));
        assert!(!GoogleProvider::is_jwt_shaped("opaque-token-value"));
    }
}
