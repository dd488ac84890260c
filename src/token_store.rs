//! Encrypted persistence for provider OAuth tokens.
//!
//! A `TokenBackend` trait so the gateway can run with either the
//! always-available in-memory backend or, when the `postgres-tokens` feature
//! is enabled and `DATABASE_URL` is set, a durable Postgres-backed one bound
//! to a table named `TOKENS`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto;
use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub provider: String,
    pub subject: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl StoredToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[async_trait::async_trait]
pub trait TokenBackend: Send + Sync {
    async fn get(&self, provider: &str, subject: &str) -> GatewayResultToken;
    async fn put(&self, token: StoredToken) -> Result<(), GatewayError>;
    async fn delete(&self, provider: &str, subject: &str) -> Result<(), GatewayError>;
    /// Removes all tokens whose `expires_at` is in the past. Returns the
    /// count removed. Driven by the container's periodic sweep.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, GatewayError>;
}

type GatewayResultToken = Result<Option<StoredToken>, GatewayError>;

/// Encryption key sourcing: in production, a missing key aborts startup
/// (`GatewayError::KeyMissing`); everywhere else a fixed, clearly-marked
/// fallback is used so dev environments still exercise the encrypted code
/// path.
fn resolve_secret(key_env: &str, production: bool) -> Result<String, GatewayError> {
    match crypto::key_from_env(key_env) {
        Ok(secret) => Ok(secret),
        Err(_) if production => Err(GatewayError::KeyMissing),
        Err(_) => {
            tracing::warn!(var = key_env, "encryption key not set; using an insecure development-only key");
            Ok("dev-only-insecure-key-do-not-use-in-prod".to_string())
        }
    }
}

pub struct InMemoryTokenStore {
    secret: String,
    inner: RwLock<HashMap<(String, String), String>>,
}

impl InMemoryTokenStore {
    pub fn new(key_env: &str, production: bool) -> Result<Self, GatewayError> {
        Ok(Self {
            secret: resolve_secret(key_env, production)?,
            inner: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl TokenBackend for InMemoryTokenStore {
    async fn get(&self, provider: &str, subject: &str) -> GatewayResultToken {
        let key = (provider.to_string(), subject.to_string());
        let guard = self.inner.read().await;
        let Some(envelope) = guard.get(&key) else {
            return Ok(None);
        };
        let json = crypto::decrypt(envelope, &self.secret)?;
        let token: StoredToken =
            serde_json::from_str(&json).map_err(|_| GatewayError::CorruptCiphertext)?;
        Ok(Some(token))
    }

    async fn put(&self, token: StoredToken) -> Result<(), GatewayError> {
        let key = (token.provider.clone(), token.subject.clone());
        let json = serde_json::to_string(&token).map_err(|_| GatewayError::CorruptCiphertext)?;
        let envelope = crypto::encrypt(&json, &self.secret)?;
        self.inner.write().await.insert(key, envelope);
        Ok(())
    }

    async fn delete(&self, provider: &str, subject: &str) -> Result<(), GatewayError> {
        let key = (provider.to_string(), subject.to_string());
        self.inner.write().await.remove(&key);
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, GatewayError> {
        let mut guard = self.inner.write().await;
        let mut expired_keys = Vec::new();
        for (key, envelope) in guard.iter() {
            if let Ok(json) = crypto::decrypt(envelope, &self.secret) {
                if let Ok(token) = serde_json::from_str::<StoredToken>(&json) {
                    if token.is_expired(now) {
                        expired_keys.push(key.clone());
                    }
                }
            }
        }
        let removed = expired_keys.len();
        for key in expired_keys {
            guard.remove(&key);
        }
        Ok(removed)
    }
}

/// Postgres-backed adapter, compiled only when the `postgres-tokens` feature
/// is enabled. Table name is `TOKENS`.
#[cfg(feature = "postgres-tokens")]
pub mod postgres {
    use super::*;
    use sqlx::PgPool;

    pub struct PostgresTokenStore {
        pool: PgPool,
        secret: String,
    }

    impl PostgresTokenStore {
        pub fn new(pool: PgPool, key_env: &str, production: bool) -> Result<Self, GatewayError> {
            Ok(Self {
                pool,
                secret: resolve_secret(key_env, production)?,
            })
        }

        pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS TOKENS (
                    provider TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    envelope TEXT NOT NULL,
                    expires_at TIMESTAMPTZ,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    PRIMARY KEY (provider, subject)
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl TokenBackend for PostgresTokenStore {
        async fn get(&self, provider: &str, subject: &str) -> GatewayResultToken {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT envelope FROM TOKENS WHERE provider = $1 AND subject = $2")
                    .bind(provider)
                    .bind(subject)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| GatewayError::Network(e.to_string()))?;

            let Some((envelope,)) = row else {
                return Ok(None);
            };
            let json = crypto::decrypt(&envelope, &self.secret)?;
            let token: StoredToken =
                serde_json::from_str(&json).map_err(|_| GatewayError::CorruptCiphertext)?;
            Ok(Some(token))
        }

        async fn put(&self, token: StoredToken) -> Result<(), GatewayError> {
            let json =
                serde_json::to_string(&token).map_err(|_| GatewayError::CorruptCiphertext)?;
            let envelope = crypto::encrypt(&json, &self.secret)?;
            sqlx::query(
                r#"
                INSERT INTO TOKENS (provider, subject, envelope, expires_at, updated_at)
                VALUES ($1, $2, $3, $4, now())
                ON CONFLICT (provider, subject)
                DO UPDATE SET envelope = EXCLUDED.envelope,
                              expires_at = EXCLUDED.expires_at,
                              updated_at = now()
                "#,
            )
            .bind(&token.provider)
            .bind(&token.subject)
            .bind(&envelope)
            .bind(token.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
            Ok(())
        }

        async fn delete(&self, provider: &str, subject: &str) -> Result<(), GatewayError> {
            sqlx::query("DELETE FROM TOKENS WHERE provider = $1 AND subject = $2")
                .bind(provider)
                .bind(subject)
                .execute(&self.pool)
                .await
                .map_err(|e| GatewayError::Network(e.to_string()))?;
            Ok(())
        }

        async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, GatewayError> {
            let result = sqlx::query("DELETE FROM TOKENS WHERE expires_at IS NOT NULL AND expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| GatewayError::Network(e.to_string()))?;
            Ok(result.rows_affected() as usize)
        }
    }
}

pub type SharedTokenStore = Arc<dyn TokenBackend>;

/// Builds the in-memory backend, sourcing its encryption key from the
/// environment variable named `key_env`. Fails with `GatewayError::KeyMissing`
/// when `production` is true and that variable is unset.
pub fn in_memory(key_env: &str, production: bool) -> Result<SharedTokenStore, GatewayError> {
    Ok(Arc::new(InMemoryTokenStore::new(key_env, production)?))
}

#[cfg(test)]
pub(crate) fn in_memory_for_tests() -> SharedTokenStore {
    in_memory("TOKEN_ENC_KEY", false).expect("dev-mode token store never fails to construct")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(provider: &str, subject: &str, expires_at: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            provider: provider.to_string(),
            subject: subject.to_string(),
            access_token: "access-xyz".to_string(),
            refresh_token: Some("refresh-xyz".to_string()),
            expires_at,
            scope: None,
        }
    }

    #[test]
    fn missing_key_fails_fast_in_production() {
        assert!(matches!(
            InMemoryTokenStore::new("GATEWAY_TEST_DEFINITELY_ABSENT_KEY", true),
            Err(GatewayError::KeyMissing)
        ));
    }

    #[test]
    fn missing_key_falls_back_to_dev_key_outside_production() {
        assert!(InMemoryTokenStore::new("GATEWAY_TEST_DEFINITELY_ABSENT_KEY", false).is_ok());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = InMemoryTokenStore::new("TOKEN_ENC_KEY", false).unwrap();
        store.put(sample("github", "user-1", None)).await.unwrap();
        let fetched = store.get("github", "user-1").await.unwrap().unwrap();
        assert_eq!(fetched.access_token, "access-xyz");
    }

    #[tokio::test]
    async fn missing_token_is_none_not_error() {
        let store = InMemoryTokenStore::new("TOKEN_ENC_KEY", false).unwrap();
        assert!(store.get("github", "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let store = InMemoryTokenStore::new("TOKEN_ENC_KEY", false).unwrap();
        let now = Utc::now();
        store
            .put(sample("github", "expired", Some(now - chrono::Duration::hours(1))))
            .await
            .unwrap();
        store
            .put(sample("github", "valid", Some(now + chrono::Duration::hours(1))))
            .await
            .unwrap();

        let removed = store.sweep_expired(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("github", "expired").await.unwrap().is_none());
        assert!(store.get("github", "valid").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryTokenStore::new("TOKEN_ENC_KEY", false).unwrap();
        store.put(sample("github", "user-1", None)).await.unwrap();
        store.delete("github", "user-1").await.unwrap();
        assert!(store.get("github", "user-1").await.unwrap().is_none());
    }
}
