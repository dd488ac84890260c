//! Strategy-driven instance selection across a server's multiple
//! `ServerConfig` instances.
//!
//! The `weighted` strategy draws from `rand`.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: String,
    pub base_url: String,
    pub weight: u32,
    pub healthy: bool,
    /// 0.0 (unhealthy) to 1.0 (fully healthy); derived from circuit state
    /// and recent success ratio, updated by the RouteRegistry.
    pub health_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    Weighted,
    HealthScore,
}

pub struct LoadBalancer {
    strategy: Strategy,
    counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    /// Picks one instance from `candidates`, which must already be filtered
    /// to `healthy` (spec: the load balancer never overrides circuit-breaker
    /// admission, it only orders/selects among admitted instances).
    pub fn pick<'a>(
        &self,
        candidates: &'a [ServerInstance],
    ) -> Result<&'a ServerInstance, GatewayError> {
        let healthy: Vec<&ServerInstance> = candidates.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyInstance("<unnamed>".to_string()));
        }

        match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Ok(healthy[idx])
            }
            Strategy::Weighted => Ok(pick_weighted(&healthy)),
            Strategy::HealthScore => Ok(healthy
                .into_iter()
                .max_by(|a, b| a.health_score.total_cmp(&b.health_score))
                .expect("non-empty checked above")),
        }
    }
}

fn pick_weighted<'a>(candidates: &[&'a ServerInstance]) -> &'a ServerInstance {
    let total_weight: u32 = candidates.iter().map(|i| i.weight.max(1)).sum();
    let mut draw = rand::thread_rng().gen_range(0..total_weight);
    for instance in candidates {
        let weight = instance.weight.max(1);
        if draw < weight {
            return instance;
        }
        draw -= weight;
    }
    candidates.last().expect("non-empty checked by caller")
}
