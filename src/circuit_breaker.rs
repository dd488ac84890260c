//! Per-instance closed/open/half-open circuit breaker.
//!
//! One state machine per routing key (`serverID::instanceID`), each guarded
//! by its own inner lock behind a `RwLock<HashMap<..>>` so no two keys ever
//! contend on the same mutex. `allowed()` is strictly read-only; `execute()`
//! is the *sole* path that may call `on_success`/`on_failure` — no other
//! component is permitted to mutate breaker state (the Route Registry only
//! touches health scores, see `route_registry.rs`).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct KeyState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: bool,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_open_in_flight: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery: Duration::from_secs(30),
        }
    }
}

/// The outcome of `execute()` when the inner call actually ran.
#[derive(Debug)]
pub enum ExecuteError<E> {
    /// The breaker refused admission; `fn` never ran. Does **not** count as
    /// a failure.
    CircuitOpen { retry_after_ms: u64 },
    /// `fn` ran and returned an error, which has already been recorded via
    /// `on_failure`.
    Inner(E),
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<KeyState>> {
        if let Some(existing) = self.keys.read().await.get(key) {
            return existing.clone();
        }
        let mut guard = self.keys.write().await;
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::default())))
            .clone()
    }

    /// Read-only admission check. Never mutates state — used by the Route
    /// Registry to filter candidate instances before delegating to the Load
    /// Balancer.
    pub async fn allowed(&self, key: &str) -> bool {
        let lock = self.key_lock(key).await;
        let state = lock.lock().await;
        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !state.half_open_in_flight,
            CircuitState::Open => state
                .opened_at
                .map(|t| t.elapsed() >= self.config.recovery)
                .unwrap_or(false),
        }
    }

    fn retry_after_ms(&self, state: &KeyState) -> u64 {
        let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        self.config.recovery.saturating_sub(elapsed).as_millis() as u64
    }

    /// Performs the admission decision, runs `fut_fn` if admitted, and
    /// records the outcome. The only function in this module permitted to
    /// call `on_success`/`on_failure`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        fut_fn: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lock = self.key_lock(key).await;
        {
            let mut state = lock.lock().await;
            match state.state {
                CircuitState::Closed => {}
                CircuitState::Open => {
                    let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                    if elapsed >= self.config.recovery {
                        state.state = CircuitState::HalfOpen;
                        state.failure_count = 0;
                        state.success_count = 0;
                        state.half_open_in_flight = true;
                    } else {
                        return Err(ExecuteError::CircuitOpen {
                            retry_after_ms: self.retry_after_ms(&state),
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight {
                        return Err(ExecuteError::CircuitOpen { retry_after_ms: 0 });
                    }
                    state.half_open_in_flight = true;
                }
            }
        }

        let result = fut_fn().await;
        match result {
            Ok(value) => {
                self.on_success(key).await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure(key).await;
                Err(ExecuteError::Inner(err))
            }
        }
    }

    /// Records a successful call. Closed-state failures counter resets;
    /// half-open successes accumulate toward `success_threshold` before the
    /// circuit fully closes.
    async fn on_success(&self, key: &str) {
        let lock = self.key_lock(key).await;
        let mut state = lock.lock().await;
        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.half_open_in_flight = false;
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call. Any half-open failure re-opens immediately;
    /// a closed-state failure trips the breaker at `failure_threshold`.
    async fn on_failure(&self, key: &str) {
        let lock = self.key_lock(key).await;
        let mut state = lock.lock().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.half_open_in_flight = false;
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.failure_count = 0;
                state.success_count = 0;
            }
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    state.failure_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state_of(&self, key: &str) -> CircuitState {
        let lock = self.key_lock(key).await;
        lock.lock().await.state
    }
}
