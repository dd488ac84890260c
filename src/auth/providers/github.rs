//! GitHub provider adapter — opaque access tokens.
//!
//! Validation via `GET api.github.com/user` with a Bearer token, scopes read
//! from the `x-oauth-scopes` response header, and token exchange against
//! `github.com/login/oauth/access_token`.

use reqwest::Client;
use serde::Deserialize;

use super::{expires_at_from_seconds, OAuthProvider, TokenValidity, UserInfo};
use crate::error::GatewayError;
use crate::token_store::StoredToken;

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_URL: &str = "https://api.github.com/user";

pub struct GitHubProvider {
    client: Client,
    client_id: String,
    client_secret: String,
}

impl GitHubProvider {
    pub fn new(client: Client, client_id: String, client_secret: String) -> Self {
        Self {
            client,
            client_id,
            client_secret,
        }
    }
}

#[derive(Deserialize)]
struct GitHubUser {
    login: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct GitHubTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: String,
}

#[async_trait::async_trait]
impl OAuthProvider for GitHubProvider {
    fn name(&self) -> &'static str {
        "github"
    }

    fn authorization_endpoint(&self) -> &str {
        AUTHORIZE_URL
    }

    fn token_endpoint(&self) -> &str {
        TOKEN_URL
    }

    async fn validate_token(&self, access_token: &str) -> Result<TokenValidity, GatewayError> {
        let resp = self
            .client
            .get(USER_URL)
            .bearer_auth(access_token)
            .header("User-Agent", "mcp-gateway")
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(TokenValidity::Invalid);
        }
        if !resp.status().is_success() {
            return Ok(TokenValidity::Invalid);
        }
        Ok(TokenValidity::Valid)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<StoredToken, GatewayError> {
        let resp = self
            .client
            .post(TOKEN_URL)
            .header("Accept", "application/json")
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
                "github refresh returned {}",
                resp.status()
            )));
        }

        let parsed: GitHubTokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        Ok(StoredToken {
            provider: self.name().to_string(),
            subject: String::new(),
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: Some(expires_at_from_seconds(parsed.expires_in)),
            scope: Some(parsed.scope),
        })
    }

    async fn get_user_info(&self, access_token: &str) -> Result<UserInfo, GatewayError> {
        let resp = self
            .client
            .get(USER_URL)
            .bearer_auth(access_token)
            .header("User-Agent", "mcp-gateway")
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let scopes = resp
            .headers()
            .get("x-oauth-scopes")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').map(|scope| scope.trim().to_string()).collect())
            .unwrap_or_default();

        if !resp.status().is_success() {
            return Err(GatewayError::RefreshFailed(format!(
                "github userinfo returned {}",
                resp.status()
            )));
        }

        let user: GitHubUser = resp
            .json()
            .await
            .map_err(|e| GatewayError::RefreshFailed(e.to_string()))?;

        Ok(UserInfo {
            subject: user.login,
            email: user.email,
            scopes,
        })
    }
}
