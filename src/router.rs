//! The call path every inbound `tools/call` and `resources/read` goes
//! through — resolve → authenticate → admit → retry → forward → record.
//!
//! Composes the Aggregator, Multi-Auth Manager, Route Registry, and Circuit
//! Breaker into one dispatch path. Transport/circuit failures are turned into
//! structured `{isError: true, content: {...}}` results rather than
//! propagated raw — callers (the `/mcp/*` handlers) just serialize whatever
//! this module returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};

use crate::aggregator::Aggregator;
use crate::auth::{Delegation, MultiAuthManager, PreparedAuth};
use crate::backend::ToolCaller;
use crate::circuit_breaker::{CircuitBreaker, ExecuteError};
use crate::error::GatewayError;
use crate::retry::{run_with_retry, Outcome, RetryPolicy};
use crate::route_registry::RouteRegistry;

pub struct CallToolRequest {
    pub name: String,
    pub arguments: Value,
}

pub struct ReadResourceRequest {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallToolResult {
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub content: Value,
}

/// Either a normal (possibly error) result, or a structured delegation the
/// caller must hand back to its client instead of contacting a backend at
/// all.
pub enum CallOutcome {
    Result(CallToolResult),
    Delegation(Delegation),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTool {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResource {
    pub uri: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

fn instance_key(server_id: &str, instance_id: &str) -> String {
    format!("{server_id}::{instance_id}")
}

/// Upper bound on distinct instances tried for a single call before giving
/// up and surfacing the last error, so a server with many failing instances
/// doesn't turn one client request into an unbounded fan-out.
const MAX_FAILOVER_INSTANCES: usize = 3;

fn error_result(err: &GatewayError) -> CallToolResult {
    let mut content = json!({
        "error": err.code(),
        "message": err.to_string(),
    });
    if let GatewayError::CircuitOpen { retry_after_ms } = err {
        content["retryAfterMs"] = json!(retry_after_ms);
    }
    CallToolResult {
        is_error: true,
        content,
    }
}

pub struct Router {
    aggregator: Arc<Aggregator>,
    registry: Arc<RouteRegistry>,
    breaker: Arc<CircuitBreaker>,
    auth: Arc<MultiAuthManager>,
    backend: Arc<dyn ToolCaller>,
    retry_policy: RetryPolicy,
}

impl Router {
    pub fn new(
        aggregator: Arc<Aggregator>,
        registry: Arc<RouteRegistry>,
        breaker: Arc<CircuitBreaker>,
        auth: Arc<MultiAuthManager>,
        backend: Arc<dyn ToolCaller>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            aggregator,
            registry,
            breaker,
            auth,
            backend,
            retry_policy,
        }
    }

    pub async fn list_tools(&self) -> Vec<AggregatedTool> {
        self.aggregator
            .all_tools()
            .await
            .into_iter()
            .map(|(name, def)| AggregatedTool {
                name,
                description: def.description,
                input_schema: def.input_schema,
            })
            .collect()
    }

    pub async fn list_resources(&self) -> Vec<AggregatedResource> {
        self.aggregator
            .all_resources()
            .await
            .into_iter()
            .map(|(uri, def)| AggregatedResource {
                uri,
                name: def.name,
                description: def.description,
                mime_type: def.mime_type,
            })
            .collect()
    }

    /// No push-notification transport exists at this layer (the gateway
    /// speaks plain request/response HTTP to its backends); this just
    /// confirms the resource is routable, matching the other read-only
    /// list operations' terminal, structured-result style.
    pub async fn subscribe(&self, uri: &str) -> Result<(), GatewayError> {
        self.aggregator
            .resolve_resource(uri)
            .await
            .map(|_| ())
            .ok_or_else(|| GatewayError::InvalidUri(uri.to_string()))
    }

    pub async fn call(&self, req: CallToolRequest, client_token: &str) -> CallOutcome {
        let Some(mapping) = self.aggregator.resolve_tool(&req.name).await else {
            return CallOutcome::Result(error_result(&GatewayError::InvalidToolName(req.name)));
        };

        let headers = match self.auth.prepare_headers(&mapping.server_id, client_token).await {
            Ok(PreparedAuth::Headers(h)) => h,
            Ok(PreparedAuth::Delegation(delegation)) => return CallOutcome::Delegation(delegation),
            Err(e) => return CallOutcome::Result(error_result(&e)),
        };

        let server_id = mapping.server_id.clone();
        let original_name = mapping.original_name.clone();
        let arguments = req.arguments;
        self.dispatch_with_failover(&server_id, headers, move |backend, base_url, headers, timeout| {
            let original_name = original_name.clone();
            let arguments = arguments.clone();
            async move {
                backend
                    .call_tool(&base_url, &original_name, &arguments, &headers, timeout)
                    .await
            }
        })
        .await
    }

    /// Resolves an instance, runs `invoke` under retry + the circuit
    /// breaker, and on exhaustion fails over to the next eligible instance
    /// for the same server. Bounded to one failover attempt per additional
    /// instance — never revisits an instance already tried this call.
    async fn dispatch_with_failover<F, Fut>(
        &self,
        server_id: &str,
        headers: HashMap<String, String>,
        invoke: F,
    ) -> CallOutcome
    where
        F: Fn(Arc<dyn ToolCaller>, String, HashMap<String, String>, std::time::Duration) -> Fut
            + Clone,
        Fut: std::future::Future<Output = Result<Value, GatewayError>>,
    {
        tracing::debug!(
            server_id = %server_id,
            headers = ?crate::logging::redact_headers(&headers),
            "dispatching call"
        );

        let mut tried = Vec::new();
        let mut last_err = GatewayError::NoRoute(server_id.to_string());

        loop {
            let instance = if tried.is_empty() {
                self.registry.pick(server_id).await
            } else {
                self.registry.pick_excluding(server_id, tried.last().unwrap()).await
            };
            let instance = match instance {
                Ok(instance) => instance,
                Err(e) => {
                    if tried.is_empty() {
                        return CallOutcome::Result(error_result(&e));
                    }
                    // No further instance to fail over to: surface the last
                    // real attempt's error rather than "no healthy instance".
                    return CallOutcome::Result(error_result(&last_err));
                }
            };

            let key = instance_key(server_id, &instance.id);
            let backend = self.backend.clone();
            let retry_policy = self.retry_policy.clone();
            let base_url = instance.base_url.clone();
            let invoke = invoke.clone();
            let attempt_headers = headers.clone();

            let started = Instant::now();
            let outcome = self
                .breaker
                .execute(&key, move || async move {
                    match run_with_retry(&retry_policy, || GatewayError::Timeout, |_attempt| {
                        let headers = attempt_headers.clone();
                        let backend = backend.clone();
                        let base_url = base_url.clone();
                        let invoke = invoke.clone();
                        let timeout = retry_policy.per_attempt_timeout;
                        async move {
                            match invoke(backend, base_url, headers, timeout).await {
                                Ok(value) => Ok(value),
                                Err(e) => {
                                    let retryable = e.is_retryable();
                                    Err((e, retryable, None))
                                }
                            }
                        }
                    })
                    .await
                    {
                        Outcome::Success(value) => Ok(value),
                        Outcome::Failed(e) => Err(e),
                    }
                })
                .await;

            match outcome {
                Ok(value) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.registry.mark_success(server_id, &instance.id, latency_ms).await;
                    return CallOutcome::Result(CallToolResult {
                        is_error: false,
                        content: value,
                    });
                }
                Err(ExecuteError::CircuitOpen { retry_after_ms }) => {
                    last_err = GatewayError::CircuitOpen { retry_after_ms };
                    tried.push(instance.id);
                }
                Err(ExecuteError::Inner(e)) => {
                    self.registry.mark_failure(server_id, &instance.id).await;
                    last_err = e;
                    tried.push(instance.id);
                }
            }

            if tried.len() >= MAX_FAILOVER_INSTANCES {
                return CallOutcome::Result(error_result(&last_err));
            }
        }
    }

    pub async fn read(&self, req: ReadResourceRequest, client_token: &str) -> CallOutcome {
        let Some(mapping) = self.aggregator.resolve_resource(&req.uri).await else {
            return CallOutcome::Result(error_result(&GatewayError::InvalidUri(req.uri)));
        };

        let headers = match self.auth.prepare_headers(&mapping.server_id, client_token).await {
            Ok(PreparedAuth::Headers(h)) => h,
            Ok(PreparedAuth::Delegation(delegation)) => return CallOutcome::Delegation(delegation),
            Err(e) => return CallOutcome::Result(error_result(&e)),
        };

        let server_id = mapping.server_id.clone();
        self.dispatch_with_failover(&server_id, headers, move |backend, base_url, headers, timeout| {
            let original_uri = mapping.original_uri.clone();
            async move { backend.read_resource(&base_url, &original_uri, &headers, timeout).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::PrefixStrategy;
    use crate::auth::{AuthStrategy, ProxyFallback, ServerAuthConfig};
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::load_balancer::{ServerInstance, Strategy};
    use crate::token_store::in_memory_for_tests;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubCaller {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait::async_trait]
    impl ToolCaller for StubCaller {
        async fn call_tool(
            &self,
            _base_url: &str,
            original_name: &str,
            _arguments: &Value,
            _headers: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(GatewayError::Network("boom".to_string()));
            }
            Ok(json!({ "echoed": original_name }))
        }

        async fn read_resource(
            &self,
            _base_url: &str,
            original_uri: &str,
            _headers: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            Ok(json!({ "uri": original_uri }))
        }
    }

    struct PerInstanceCaller {
        fail_base_url: String,
    }

    #[async_trait::async_trait]
    impl ToolCaller for PerInstanceCaller {
        async fn call_tool(
            &self,
            base_url: &str,
            original_name: &str,
            _arguments: &Value,
            _headers: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            if base_url == self.fail_base_url {
                return Err(GatewayError::Network("boom".to_string()));
            }
            Ok(json!({ "echoed": original_name, "via": base_url }))
        }

        async fn read_resource(
            &self,
            base_url: &str,
            original_uri: &str,
            _headers: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            Ok(json!({ "uri": original_uri, "via": base_url }))
        }
    }

    async fn router_with_two_instances(backend: Arc<dyn ToolCaller>, strategy: AuthStrategy) -> Router {
        let aggregator = Arc::new(Aggregator::new(PrefixStrategy::ServerId));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            recovery: Duration::from_millis(20),
        }));
        let registry = Arc::new(RouteRegistry::new(breaker.clone(), Strategy::RoundRobin));
        let mut servers = HashMap::new();
        servers.insert(
            "srv".to_string(),
            vec![
                ServerInstance {
                    id: "i1".to_string(),
                    base_url: "http://i1".to_string(),
                    weight: 1,
                    healthy: true,
                    health_score: 100.0,
                },
                ServerInstance {
                    id: "i2".to_string(),
                    base_url: "http://i2".to_string(),
                    weight: 1,
                    healthy: true,
                    health_score: 100.0,
                },
            ],
        );
        registry.update_servers(servers).await;

        let auth = Arc::new(MultiAuthManager::new(HashMap::new(), in_memory_for_tests(), None, "aud".to_string(), None));
        let mut configs = HashMap::new();
        configs.insert(
            "srv".to_string(),
            ServerAuthConfig {
                strategy,
                provider: None,
                required_scopes: vec![],
                client_id: None,
                proxy_fallback: ProxyFallback::Passthrough,
            },
        );
        auth.update_configs(configs).await;

        let retry_policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };

        let router = Router::new(aggregator.clone(), registry, breaker, auth, backend, retry_policy);
        aggregator
            .discover(&["srv".to_string()], Arc::new(super::tests_support::StubDiscovery))
            .await;
        router
    }

    async fn router_with(backend: Arc<dyn ToolCaller>, strategy: AuthStrategy) -> Router {
        let aggregator = Arc::new(Aggregator::new(PrefixStrategy::ServerId));
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery: Duration::from_millis(20),
        }));
        let registry = Arc::new(RouteRegistry::new(breaker.clone(), Strategy::RoundRobin));
        let mut servers = HashMap::new();
        servers.insert(
            "srv".to_string(),
            vec![ServerInstance {
                id: "i1".to_string(),
                base_url: "http://backend.local".to_string(),
                weight: 1,
                healthy: true,
                health_score: 100.0,
            }],
        );
        registry.update_servers(servers).await;

        let auth = Arc::new(MultiAuthManager::new(HashMap::new(), in_memory_for_tests(), None, "aud".to_string(), None));
        let mut configs = HashMap::new();
        configs.insert(
            "srv".to_string(),
            ServerAuthConfig {
                strategy,
                provider: None,
                required_scopes: vec![],
                client_id: None,
                proxy_fallback: ProxyFallback::Passthrough,
            },
        );
        auth.update_configs(configs).await;

        let retry_policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };

        let router = Router::new(aggregator.clone(), registry, breaker, auth, backend, retry_policy);
        aggregator
            .discover(&["srv".to_string()], Arc::new(super::tests_support::StubDiscovery))
            .await;
        router
    }

    #[tokio::test]
    async fn unresolved_tool_returns_structured_no_route_error() {
        let backend = Arc::new(StubCaller {
            calls: AtomicU32::new(0),
            fail_times: 0,
        });
        let router = router_with(backend, AuthStrategy::BypassAuth).await;
        match router.call(CallToolRequest { name: "nodotnoserver".to_string(), arguments: json!({}) }, "tok").await {
            CallOutcome::Result(result) => {
                assert!(result.is_error);
                assert_eq!(result.content["error"], "invalid_tool_name");
            }
            CallOutcome::Delegation(_) => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn happy_path_calls_backend_and_marks_success() {
        let backend = Arc::new(StubCaller {
            calls: AtomicU32::new(0),
            fail_times: 0,
        });
        let router = router_with(backend, AuthStrategy::BypassAuth).await;
        match router.call(CallToolRequest { name: "srv.echo".to_string(), arguments: json!({}) }, "tok").await {
            CallOutcome::Result(result) => {
                assert!(!result.is_error);
                assert_eq!(result.content["echoed"], "echo");
            }
            CallOutcome::Delegation(_) => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn delegate_oauth_returns_delegation_without_calling_backend() {
        let backend = Arc::new(StubCaller {
            calls: AtomicU32::new(0),
            fail_times: 0,
        });
        let router = router_with(backend.clone(), AuthStrategy::DelegateOauth).await;
        match router.call(CallToolRequest { name: "srv.echo".to_string(), arguments: json!({}) }, "tok").await {
            CallOutcome::Delegation(_) => {}
            CallOutcome::Result(_) => panic!("expected a delegation"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let backend = Arc::new(StubCaller {
            calls: AtomicU32::new(0),
            fail_times: 1,
        });
        let router = router_with(backend.clone(), AuthStrategy::BypassAuth).await;
        match router.call(CallToolRequest { name: "srv.echo".to_string(), arguments: json!({}) }, "tok").await {
            CallOutcome::Result(result) => assert!(!result.is_error),
            CallOutcome::Delegation(_) => panic!("expected a result"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures_and_reports_retry_after() {
        let backend = Arc::new(StubCaller {
            calls: AtomicU32::new(0),
            fail_times: u32::MAX,
        });
        let router = router_with(backend, AuthStrategy::BypassAuth).await;

        for _ in 0..2 {
            let _ = router.call(CallToolRequest { name: "srv.echo".to_string(), arguments: json!({}) }, "tok").await;
        }

        match router.call(CallToolRequest { name: "srv.echo".to_string(), arguments: json!({}) }, "tok").await {
            CallOutcome::Result(result) => {
                assert!(result.is_error);
                assert_eq!(result.content["error"], "circuit_open");
            }
            CallOutcome::Delegation(_) => panic!("expected a result"),
        }
    }

    #[tokio::test]
    async fn failover_tries_the_next_instance_when_the_first_keeps_failing() {
        let backend = Arc::new(PerInstanceCaller {
            fail_base_url: "http://i1".to_string(),
        });
        let router = router_with_two_instances(backend, AuthStrategy::BypassAuth).await;

        match router
            .call(CallToolRequest { name: "srv.echo".to_string(), arguments: json!({}) }, "tok")
            .await
        {
            CallOutcome::Result(result) => {
                assert!(!result.is_error, "expected failover to a working instance, got {:?}", result.content);
                assert_eq!(result.content["via"], "http://i2");
            }
            CallOutcome::Delegation(_) => panic!("expected a result"),
        }

        assert_eq!(
            router.registry.breaker().state_of(&instance_key("srv", "i1")).await,
            CircuitState::Open,
            "the permanently failing instance's breaker should have tripped"
        );
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use crate::aggregator::{DiscoverySource, RawCapabilities, ResourceDef, ToolDef};
    use crate::error::GatewayError;

    pub struct StubDiscovery;

    #[async_trait::async_trait]
    impl DiscoverySource for StubDiscovery {
        async fn fetch_capabilities(&self, _server_id: &str) -> Result<RawCapabilities, GatewayError> {
            Ok(RawCapabilities {
                tools: vec![ToolDef {
                    name: "echo".to_string(),
                    description: None,
                    input_schema: None,
                }],
                resources: vec![ResourceDef {
                    uri: "readme".to_string(),
                    name: None,
                    description: None,
                    mime_type: None,
                }],
            })
        }
    }
}
