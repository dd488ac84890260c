//! `/oauth/authorize`, `/oauth/callback`, `/oauth/token` — the browser-facing
//! half of delegated OAuth, backed by `OAuthFlowController`.
//!
//! Redirect responses built with `axum::response::Redirect`; the state/PKCE
//! cookie is set via a raw `Set-Cookie` header rather than a cookie jar
//! extractor.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;

use crate::container::Container;
use crate::oauth_flow::{AuthorizeRequest, CallbackRequest};

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub provider: Option<String>,
    pub server_id: Option<String>,
    pub return_to: Option<String>,
    #[allow(dead_code)]
    pub scopes: Option<String>,
}

pub async fn authorize(
    State(container): State<Arc<Container>>,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let wiring = container.wiring().await;

    let provider = match query.provider {
        Some(provider) => provider,
        None => match &query.server_id {
            Some(server_id) => wiring
                .auth
                .provider_for_server(server_id)
                .await
                .unwrap_or_default(),
            None => String::new(),
        },
    };

    let outcome = wiring
        .oauth_flow
        .authorize(AuthorizeRequest {
            provider,
            server_id: query.server_id,
            return_to: query.return_to,
            client_binding: bearer_token(&headers),
        })
        .await;

    match outcome {
        Ok(outcome) => {
            let mut response = Redirect::to(&outcome.redirect_url).into_response();
            response
                .headers_mut()
                .insert(header::SET_COOKIE, outcome.state_cookie.parse().unwrap());
            response
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

pub async fn callback(
    State(container): State<Arc<Container>>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(error) = query.error {
        return (StatusCode::BAD_REQUEST, format!("oauth error: {error}")).into_response();
    }

    let (Some(code), Some(state)) = (query.code, query.state) else {
        return (StatusCode::BAD_REQUEST, "missing code or state").into_response();
    };

    let wiring = container.wiring().await;
    let cookie_state = cookie_value(&headers, "mcp_oauth_state");

    match wiring
        .oauth_flow
        .callback(CallbackRequest {
            code,
            state,
            cookie_state,
        })
        .await
    {
        Ok(outcome) => {
            let mut response = Redirect::to(&outcome.redirect_to).into_response();
            response
                .headers_mut()
                .insert(header::SET_COOKIE, outcome.clear_cookie.parse().unwrap());
            response
        }
        Err(e) => e.into_response(),
    }
}
