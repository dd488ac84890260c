//! Server → instances map, health scores, and the resolution cache.
//!
//! **Never** calls `CircuitBreaker::on_success`/`on_failure` directly — only
//! `CircuitBreaker::execute` (invoked by the Router) may do that; this
//! registry only reads `allowed` and writes health scores. Mixing the two
//! would double-count a single failure against the breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::GatewayError;
use crate::load_balancer::{LoadBalancer, ServerInstance, Strategy};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);
const HEALTH_UP_STEP: f64 = 2.0;
const HEALTH_DOWN_STEP: f64 = 10.0;
/// Latency budget (ms) beyond which `k_up`'s bonus decays toward zero.
const LATENCY_BUDGET_MS: f64 = 200.0;

struct CachedPick {
    instance_id: String,
    picked_at: Instant,
}

pub struct RouteRegistry {
    servers: RwLock<HashMap<String, Vec<ServerInstance>>>,
    cache: RwLock<HashMap<String, CachedPick>>,
    cache_ttl: Duration,
    breaker: Arc<CircuitBreaker>,
    balancer: LoadBalancer,
}

impl RouteRegistry {
    pub fn new(breaker: Arc<CircuitBreaker>, strategy: Strategy) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            cache_ttl: DEFAULT_CACHE_TTL,
            breaker,
            balancer: LoadBalancer::new(strategy),
        }
    }

    /// Replaces the instance set for every server named in `servers` in one
    /// shot — topology changes are safe to apply on a hot reload.
    pub async fn update_servers(&self, servers: HashMap<String, Vec<ServerInstance>>) {
        *self.servers.write().await = servers;
        self.cache.write().await.clear();
    }

    pub async fn refresh(&self) {
        self.cache.write().await.clear();
    }

    fn instance_key(server_id: &str, instance_id: &str) -> String {
        format!("{server_id}::{instance_id}")
    }

    /// Resolution algorithm: (a) filter by `CircuitBreaker` admission, (b)
    /// delegate to the Load Balancer, (c) cache the result for `cache_ttl`,
    /// bypassed early if the cached instance is no longer admitted.
    ///
    /// If every instance is currently blocked by its breaker, this still
    /// returns one of them rather than `ErrNoHealthyInstance` — a
    /// fully-tripped single-instance server must still reach
    /// `CircuitBreaker.execute` so its own `ErrCircuitOpen`/`retryAfterMs`
    /// surfaces, instead of the Route Registry pre-empting it with a less
    /// informative error. `ErrNoHealthyInstance` is reserved for a server
    /// with no instances at all.
    pub async fn pick(&self, server_id: &str) -> Result<ServerInstance, GatewayError> {
        if let Some(cached) = self.cache.read().await.get(server_id) {
            if cached.picked_at.elapsed() < self.cache_ttl {
                let key = Self::instance_key(server_id, &cached.instance_id);
                if self.breaker.allowed(&key).await {
                    let servers = self.servers.read().await;
                    if let Some(instances) = servers.get(server_id) {
                        if let Some(instance) =
                            instances.iter().find(|i| i.id == cached.instance_id)
                        {
                            return Ok(instance.clone());
                        }
                    }
                }
            }
        }

        let servers = self.servers.read().await;
        let instances = servers
            .get(server_id)
            .ok_or_else(|| GatewayError::NoRoute(server_id.to_string()))?;

        let picked = self.select(server_id, instances).await?;

        self.cache.write().await.insert(
            server_id.to_string(),
            CachedPick {
                instance_id: picked.id.clone(),
                picked_at: Instant::now(),
            },
        );

        Ok(picked)
    }

    /// Same resolution as [`pick`](Self::pick) but bypasses the cache and
    /// refuses to return `exclude`, so the Router can fail over to a
    /// different instance once retries on the first are exhausted.
    pub async fn pick_excluding(
        &self,
        server_id: &str,
        exclude: &str,
    ) -> Result<ServerInstance, GatewayError> {
        let servers = self.servers.read().await;
        let instances = servers
            .get(server_id)
            .ok_or_else(|| GatewayError::NoRoute(server_id.to_string()))?;

        let others: Vec<ServerInstance> = instances
            .iter()
            .filter(|i| i.id != exclude)
            .cloned()
            .collect();

        let picked = self.select(server_id, &others).await?;

        self.cache.write().await.insert(
            server_id.to_string(),
            CachedPick {
                instance_id: picked.id.clone(),
                picked_at: Instant::now(),
            },
        );

        Ok(picked)
    }

    /// Shared admission + selection step for [`pick`](Self::pick) and
    /// [`pick_excluding`](Self::pick_excluding): filters `candidates` by
    /// breaker admission and delegates to the Load Balancer, falling back to
    /// an unfiltered pick only when admission excludes everything but
    /// candidates still exist (see `pick`'s doc comment for why).
    async fn select(
        &self,
        server_id: &str,
        candidates: &[ServerInstance],
    ) -> Result<ServerInstance, GatewayError> {
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstance(server_id.to_string()));
        }

        let mut admitted = Vec::with_capacity(candidates.len());
        for instance in candidates {
            let key = Self::instance_key(server_id, &instance.id);
            let mut candidate = instance.clone();
            candidate.healthy = self.breaker.allowed(&key).await;
            admitted.push(candidate);
        }

        if let Ok(picked) = self.balancer.pick(&admitted) {
            return Ok(picked.clone());
        }

        let mut forced: Vec<ServerInstance> = candidates.to_vec();
        for instance in &mut forced {
            instance.healthy = true;
        }
        self.balancer
            .pick(&forced)
            .map(|i| i.clone())
            .map_err(|_| GatewayError::NoHealthyInstance(server_id.to_string()))
    }

    fn latency_bonus(latency_ms: f64) -> f64 {
        if latency_ms <= LATENCY_BUDGET_MS {
            1.0
        } else {
            (LATENCY_BUDGET_MS / latency_ms).clamp(0.0, 1.0)
        }
    }

    /// Updates health score only — never touches breaker state.
    pub async fn mark_success(&self, server_id: &str, instance_id: &str, latency_ms: f64) {
        let mut servers = self.servers.write().await;
        if let Some(instances) = servers.get_mut(server_id) {
            if let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) {
                let bonus = HEALTH_UP_STEP * Self::latency_bonus(latency_ms);
                instance.health_score = (instance.health_score + bonus).min(100.0);
            }
        }
    }

    pub async fn mark_failure(&self, server_id: &str, instance_id: &str) {
        let mut servers = self.servers.write().await;
        if let Some(instances) = servers.get_mut(server_id) {
            if let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) {
                instance.health_score = (instance.health_score - HEALTH_DOWN_STEP).max(0.0);
            }
        }
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    /// Full instance table, cloned out from under the lock. Used by the
    /// health and metrics surfaces — never by routing itself.
    pub async fn snapshot(&self) -> HashMap<String, Vec<ServerInstance>> {
        self.servers.read().await.clone()
    }

    pub fn breaker_key(server_id: &str, instance_id: &str) -> String {
        Self::instance_key(server_id, instance_id)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;

    fn instance(id: &str, score: f64) -> ServerInstance {
        ServerInstance {
            id: id.to_string(),
            base_url: format!("http://{id}"),
            weight: 1,
            healthy: true,
            health_score: score,
        }
    }

    async fn registry_with(servers: HashMap<String, Vec<ServerInstance>>) -> RouteRegistry {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let registry = RouteRegistry::new(breaker, Strategy::HealthScore);
        registry.update_servers(servers).await;
        registry
    }

    #[tokio::test]
    async fn picks_healthiest_instance() {
        let mut servers = HashMap::new();
        servers.insert(
            "S".to_string(),
            vec![instance("i1", 10.0), instance("i2", 90.0)],
        );
        let registry = registry_with(servers).await;
        let picked = registry.pick("S").await.unwrap();
        assert_eq!(picked.id, "i2");
    }

    #[tokio::test]
    async fn unknown_server_is_no_route() {
        let registry = registry_with(HashMap::new()).await;
        assert!(matches!(
            registry.pick("missing").await,
            Err(GatewayError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn mark_success_and_failure_only_touch_health_score() {
        let mut servers = HashMap::new();
        servers.insert("S".to_string(), vec![instance("i1", 50.0)]);
        let registry = registry_with(servers).await;

        registry.mark_success("S", "i1", 10.0).await;
        let after_success = registry.pick("S").await.unwrap();
        assert!(after_success.health_score > 50.0);

        registry.mark_failure("S", "i1").await;
        let after_failure = registry.pick("S").await.unwrap();
        assert!(after_failure.health_score < after_success.health_score);
    }

    #[tokio::test]
    async fn update_servers_clears_cache() {
        let mut servers = HashMap::new();
        servers.insert("S".to_string(), vec![instance("i1", 50.0)]);
        let registry = registry_with(servers.clone()).await;
        let _ = registry.pick("S").await.unwrap();

        servers.insert("S".to_string(), vec![instance("i2", 50.0)]);
        registry.update_servers(servers).await;
        let picked = registry.pick("S").await.unwrap();
        assert_eq!(picked.id, "i2");
    }

    #[tokio::test]
    async fn pick_excluding_skips_the_named_instance() {
        let mut servers = HashMap::new();
        servers.insert(
            "S".to_string(),
            vec![instance("i1", 90.0), instance("i2", 10.0)],
        );
        let registry = registry_with(servers).await;
        let picked = registry.pick_excluding("S", "i1").await.unwrap();
        assert_eq!(picked.id, "i2");
    }

    #[tokio::test]
    async fn pick_excluding_errors_when_it_was_the_only_instance() {
        let mut servers = HashMap::new();
        servers.insert("S".to_string(), vec![instance("i1", 90.0)]);
        let registry = registry_with(servers).await;
        assert!(matches!(
            registry.pick_excluding("S", "i1").await,
            Err(GatewayError::NoHealthyInstance(_))
        ));
    }
}
