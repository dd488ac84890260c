//! Builds every component from a `MasterConfig` and holds the live wiring
//! behind one swappable `Arc`, so a hot reload replaces the whole graph
//! atomically instead of updating components one lock at a time. The live
//! graph is wrapped in an `RwLock<Arc<Wiring>>` so `Container::reload` can
//! swap it out from under in-flight requests without either side ever
//! holding two locks at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::aggregator::{Aggregator, PrefixStrategy};
use crate::auth::providers::custom_oidc::{CustomOidcConfig, CustomOidcProvider};
use crate::auth::providers::github::GitHubProvider;
use crate::auth::providers::google::GoogleProvider;
use crate::auth::providers::OAuthProvider;
use crate::auth::{AuthStrategy as RuntimeAuthStrategy, MultiAuthManager, ProxyFallback, ServerAuthConfig};
use crate::backend::{BackendClient, RegistryBackedDiscovery};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::{AuthStrategyConfig, ConfigManager, MasterConfig};
use crate::error::GatewayError;
use crate::load_balancer::ServerInstance;
use crate::oauth_flow::OAuthFlowController;
use crate::route_registry::RouteRegistry;
use crate::router::Router;
use crate::token_store::{self, SharedTokenStore};

/// Minimum time between periodic sweeps of expired tokens/flows.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a request handler needs, built fresh from one `MasterConfig`.
pub struct Wiring {
    pub aggregator: Arc<Aggregator>,
    pub registry: Arc<RouteRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub auth: Arc<MultiAuthManager>,
    pub router: Arc<Router>,
    pub oauth_flow: Arc<OAuthFlowController>,
    pub token_store: SharedTokenStore,
}

fn build_providers(config: &MasterConfig) -> HashMap<String, Arc<dyn OAuthProvider>> {
    let mut providers: HashMap<String, Arc<dyn OAuthProvider>> = HashMap::new();
    let client = reqwest::Client::new();

    for (name, provider_config) in &config.delegation.providers {
        let secret = provider_config.client_secret.clone().unwrap_or_default();
        match name.as_str() {
            "github" => {
                providers.insert(
                    name.clone(),
                    Arc::new(GitHubProvider::new(client.clone(), provider_config.client_id.clone(), secret)),
                );
            }
            "google" => {
                providers.insert(
                    name.clone(),
                    Arc::new(GoogleProvider::new(client.clone(), provider_config.client_id.clone(), secret)),
                );
            }
            _ => {
                providers.insert(
                    name.clone(),
                    Arc::new(CustomOidcProvider::new(
                        client.clone(),
                        CustomOidcConfig {
                            client_id: provider_config.client_id.clone(),
                            client_secret: provider_config.client_secret.clone(),
                            authorization_endpoint: provider_config
                                .authorization_endpoint
                                .clone()
                                .unwrap_or_default(),
                            token_endpoint: provider_config.token_endpoint.clone().unwrap_or_default(),
                            jwks_uri: provider_config.jwks_uri.clone(),
                            userinfo_endpoint: provider_config.userinfo_endpoint.clone(),
                            issuer: provider_config.issuer.clone(),
                        },
                    )),
                );
            }
        }
    }

    // `github`/`google` may be referenced by a server's auth_config without
    // an explicit entry under delegation.providers, in which case an empty
    // client_id/secret pair is registered so discovery/validation still
    // resolves a provider (refresh/token-exchange calls will simply fail
    // with a clear upstream error instead of "unknown provider").
    providers
        .entry("github".to_string())
        .or_insert_with(|| Arc::new(GitHubProvider::new(client.clone(), String::new(), String::new())));
    providers
        .entry("google".to_string())
        .or_insert_with(|| Arc::new(GoogleProvider::new(client.clone(), String::new(), String::new())));

    providers
}

fn auth_strategy_for(kind: AuthStrategyConfig) -> RuntimeAuthStrategy {
    match kind {
        AuthStrategyConfig::MasterOauth => RuntimeAuthStrategy::MasterOauth,
        AuthStrategyConfig::DelegateOauth => RuntimeAuthStrategy::DelegateOauth,
        AuthStrategyConfig::BypassAuth => RuntimeAuthStrategy::BypassAuth,
        AuthStrategyConfig::ProxyOauth => RuntimeAuthStrategy::ProxyOauth,
    }
}

/// Builds a complete [`Wiring`] from `config`. Discovery runs once,
/// synchronously, before the wiring is considered ready — a server that
/// fails discovery simply starts with an empty catalog rather than aborting
/// startup.
pub async fn build_wiring(config: &MasterConfig, token_store: SharedTokenStore) -> Result<Wiring, GatewayError> {
    let providers = build_providers(config);

    let auth = Arc::new(MultiAuthManager::new(
        providers.clone(),
        token_store.clone(),
        config.master_oauth.jwks_uri.clone(),
        config.master_oauth.audience.clone(),
        config.master_oauth.issuer.clone(),
    ));

    let mut auth_configs = HashMap::new();
    for server in &config.servers {
        auth_configs.insert(
            server.id.clone(),
            ServerAuthConfig {
                strategy: auth_strategy_for(server.auth_strategy),
                provider: server.auth_config.provider.clone(),
                required_scopes: server.auth_config.required_scopes.clone(),
                client_id: server.auth_config.client_id.clone(),
                proxy_fallback: if server.auth_config.proxy_fallback_fail {
                    ProxyFallback::Fail
                } else {
                    ProxyFallback::Passthrough
                },
            },
        );
    }
    auth.update_configs(auth_configs).await;

    let breaker = Arc::new(CircuitBreaker::new(config.routing.circuit_breaker.clone().into()));
    let registry = Arc::new(RouteRegistry::new(
        breaker.clone(),
        config.routing.load_balancer.into(),
    ));

    let mut server_instances = HashMap::new();
    let mut instance_base_urls = HashMap::new();
    for server in &config.servers {
        let base_url = server.endpoint.clone().unwrap_or_default();
        instance_base_urls.insert(server.id.clone(), base_url.clone());
        server_instances.insert(
            server.id.clone(),
            vec![ServerInstance {
                id: format!("{}-0", server.id),
                base_url,
                weight: server.weight,
                healthy: true,
                health_score: 100.0,
            }],
        );
    }
    registry.update_servers(server_instances).await;

    let aggregator = Arc::new(Aggregator::new(PrefixStrategy::ServerId));
    let discovery = Arc::new(RegistryBackedDiscovery::new(instance_base_urls));
    let server_ids: Vec<String> = config.servers.iter().map(|s| s.id.clone()).collect();
    aggregator.discover(&server_ids, discovery).await;

    let backend = Arc::new(BackendClient::new());
    let router = Arc::new(Router::new(
        aggregator.clone(),
        registry.clone(),
        breaker.clone(),
        auth.clone(),
        backend,
        config.routing.retry.clone().into(),
    ));

    let oauth_flow = Arc::new(OAuthFlowController::new(
        providers,
        auth.clone(),
        config.hosting.base_url.clone(),
        config.hosting.allow_insecure_http,
    ));

    Ok(Wiring {
        aggregator,
        registry,
        breaker,
        auth,
        router,
        oauth_flow,
        token_store,
    })
}

/// Owns the config manager and the live `Wiring`, and knows how to rebuild
/// and atomically swap the latter on a hot reload.
pub struct Container {
    pub config: Arc<ConfigManager>,
    wiring: RwLock<Arc<Wiring>>,
    start_time: Instant,
}

impl Container {
    pub async fn bootstrap(config: MasterConfig) -> Result<Self, GatewayError> {
        let production = crate::config::is_production(&crate::config::detect_env());
        let token_store = token_store::in_memory(&config.security.config_key_env, production)?;
        let wiring = build_wiring(&config, token_store).await?;
        Ok(Self {
            config: Arc::new(ConfigManager::new(config)),
            wiring: RwLock::new(Arc::new(wiring)),
            start_time: Instant::now(),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn wiring(&self) -> Arc<Wiring> {
        self.wiring.read().await.clone()
    }

    /// Rebuilds the dependency graph from `next` and swaps it in under a
    /// single write lock. Validation/classification already happened in
    /// `ConfigManager::prepare`; this is the "commit" half for the runtime
    /// graph, called right after `ConfigManager::commit` accepts the new
    /// config so the two never interleave with a request in flight holding a
    /// stale `Arc`.
    pub async fn reload(&self, next: &MasterConfig) -> Result<(), GatewayError> {
        let token_store = self.wiring().await.token_store.clone();
        let rebuilt = build_wiring(next, token_store).await?;
        *self.wiring.write().await = Arc::new(rebuilt);
        Ok(())
    }

    /// Periodic housekeeping: expired token and OAuth-flow sweeps, rate
    /// limited to once per [`SWEEP_INTERVAL`] by the caller's scheduling
    /// loop rather than by this function itself.
    pub async fn sweep(&self) {
        let wiring = self.wiring().await;
        match wiring.token_store.sweep_expired(chrono::Utc::now()).await {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "swept expired tokens");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "token sweep failed"),
        }
        let removed_flows = wiring.oauth_flow.sweep_expired().await;
        if removed_flows > 0 {
            tracing::info!(removed = removed_flows, "swept expired oauth flows");
        }
    }

    /// Spawns the background sweep loop. Returns the task handle so callers
    /// (tests, graceful shutdown) can abort it.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let container = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                container.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> MasterConfig {
        MasterConfig::default()
    }

    #[tokio::test]
    async fn bootstrap_builds_empty_wiring_for_empty_config() {
        let container = Container::bootstrap(sample_config()).await.unwrap();
        let wiring = container.wiring().await;
        assert!(wiring.registry.server_ids().await.is_empty());
    }

    #[tokio::test]
    async fn reload_swaps_wiring_without_losing_token_store() {
        let container = Container::bootstrap(sample_config()).await.unwrap();
        let before = container.wiring().await;

        let mut next = sample_config();
        next.logging.level = "debug".to_string();
        container.reload(&next).await.unwrap();

        let after = container.wiring().await;
        assert!(!Arc::ptr_eq(&before.registry, &after.registry));
    }

    #[tokio::test]
    async fn sweep_runs_without_panicking_on_empty_state() {
        let container = Container::bootstrap(sample_config()).await.unwrap();
        container.sweep().await;
    }
}
