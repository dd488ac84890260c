//! Layered configuration, secret placeholder resolution, and hot-reload.
//!
//! Layers cascade defaults → config files → env vars → CLI flags via
//! `figment`. A `tracing::info!` on startup reports what was loaded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use figment::providers::{Env, Format, Json, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::crypto;
use crate::error::GatewayError;
use crate::load_balancer::Strategy;
use crate::retry::{Jitter, RetryPolicy};

const MIN_APPLY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Git,
    Npm,
    Pypi,
    Docker,
    Local,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthStrategyConfig {
    MasterOauth,
    DelegateOauth,
    BypassAuth,
    ProxyOauth,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerAuthConfigEntry {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub proxy_fallback_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub source: String,
    pub auth_strategy: AuthStrategyConfig,
    #[serde(default)]
    pub auth_config: ServerAuthConfigEntry,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterOAuthConfig {
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

fn default_audience() -> String {
    "mcp-gateway".to_string()
}

impl Default for MasterOAuthConfig {
    fn default() -> Self {
        Self {
            jwks_uri: None,
            audience: default_audience(),
            issuer: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DelegationConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub platform: String,
    /// Dev-only escape hatch for the Flow Controller's https-only rule.
    /// Never set true in a production config file.
    #[serde(default)]
    pub allow_insecure_http: bool,
}

fn default_port() -> u16 {
    8080
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            base_url: default_base_url(),
            platform: std::env::consts::OS.to_string(),
            allow_insecure_http: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    RoundRobin,
    Weighted,
    Health,
}

impl From<LoadBalancerKind> for Strategy {
    fn from(kind: LoadBalancerKind) -> Self {
        match kind {
            LoadBalancerKind::RoundRobin => Strategy::RoundRobin,
            LoadBalancerKind::Weighted => Strategy::Weighted,
            LoadBalancerKind::Health => Strategy::HealthScore,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub jitter_none: bool,
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_ms() -> u64 {
    250
}
fn default_max_ms() -> u64 {
    4000
}
fn default_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            factor: default_factor(),
            jitter_none: false,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_ms),
            max_delay: Duration::from_millis(cfg.max_ms),
            factor: cfg.factor,
            jitter: if cfg.jitter_none { Jitter::None } else { Jitter::Full },
            per_attempt_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfigEntry {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_recovery_ms")]
    pub recovery_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_recovery_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfigEntry {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_ms: default_recovery_ms(),
        }
    }
}

impl From<CircuitBreakerConfigEntry> for CircuitBreakerConfig {
    fn from(cfg: CircuitBreakerConfigEntry) -> Self {
        CircuitBreakerConfig {
            failure_threshold: cfg.failure_threshold,
            success_threshold: cfg.success_threshold,
            recovery: Duration::from_millis(cfg.recovery_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_lb")]
    pub load_balancer: LoadBalancerKind,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfigEntry,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_lb() -> LoadBalancerKind {
    LoadBalancerKind::RoundRobin
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            load_balancer: default_lb(),
            circuit_breaker: CircuitBreakerConfigEntry::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_config_key_env")]
    pub config_key_env: String,
}

fn default_config_key_env() -> String {
    "TOKEN_ENC_KEY".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            config_key_env: default_config_key_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MasterConfig {
    #[serde(default)]
    pub master_oauth: MasterOAuthConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub hosting: HostingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Current environment name: `MASTER_ENV` then `NODE_ENV`, defaulting to
/// `development`. One of `development`, `test`, `staging`, `production`.
pub fn detect_env() -> String {
    std::env::var("MASTER_ENV")
        .or_else(|_| std::env::var("NODE_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

pub fn is_production(env_name: &str) -> bool {
    env_name == "production"
}

fn merge_if_present(mut figment: Figment, stem: &str) -> Figment {
    let yaml_path = format!("{stem}.yaml");
    let json_path = format!("{stem}.json");
    if Path::new(&yaml_path).exists() {
        figment = figment.merge(Yaml::file(&yaml_path));
    }
    if Path::new(&json_path).exists() {
        figment = figment.merge(Json::file(&json_path));
    }
    figment
}

/// Loads the full cascade: defaults → `config/default.{yaml,json}` →
/// `config/{env}.{yaml,json}` → `MASTER_`-prefixed env vars (with `PORT` as
/// a bare alias for `hosting.port`) → CLI `--dotted.path=value` overrides.
/// Arrays (notably `servers`) replace rather than merge at each layer (spec
/// §4.12 invariant, also exercised in `config::tests::arrays_replace`).
pub fn load(cli_overrides: &HashMap<String, String>) -> Result<MasterConfig, GatewayError> {
    let env_name = detect_env();

    let mut figment = Figment::from(Serialized::defaults(MasterConfig::default()));
    figment = merge_if_present(figment, "config/default");
    figment = merge_if_present(figment, &format!("config/{env_name}"));
    figment = figment.merge(Env::prefixed("MASTER_").split("__"));

    if let Ok(port) = std::env::var("PORT") {
        figment = figment.merge(("hosting.port", port));
    }

    for (path, value) in cli_overrides {
        figment = figment.merge((path.as_str(), value.as_str()));
    }

    let mut config: MasterConfig = figment
        .extract()
        .map_err(|e| GatewayError::ConfigSchema(e.to_string()))?;

    resolve_secrets(&mut config, &env_name)?;
    validate(&config)?;

    tracing::info!(
        env = %env_name,
        servers = config.servers.len(),
        port = config.hosting.port,
        "configuration loaded"
    );

    Ok(config)
}

/// Parses `--dotted.path=value` CLI arguments into the override map `load`
/// expects.
pub fn parse_cli_overrides(args: &[String]) -> HashMap<String, String> {
    let mut overrides = HashMap::new();
    for arg in args {
        let Some(rest) = arg.strip_prefix("--") else {
            continue;
        };
        if let Some((path, value)) = rest.split_once('=') {
            overrides.insert(path.to_string(), value.to_string());
        }
    }
    overrides
}

/// Resolves `env:NAME` and `enc:gcm:<envelope>` secret placeholders in
/// every field that may legitimately carry one. Only touches the handful of
/// fields the schema defines as secrets, so a server's `source` or `endpoint`
/// can't accidentally be treated as ciphertext.
fn resolve_secrets(config: &mut MasterConfig, env_name: &str) -> Result<(), GatewayError> {
    let key_env = config.security.config_key_env.clone();
    for provider in config.delegation.providers.values_mut() {
        if let Some(raw) = &provider.client_secret {
            provider.client_secret = Some(resolve_secret_placeholder(raw, env_name, &key_env)?);
        }
    }
    for server in &mut config.servers {
        if let Some(raw) = &server.auth_config.client_secret {
            server.auth_config.client_secret = Some(resolve_secret_placeholder(raw, env_name, &key_env)?);
        }
    }
    Ok(())
}

/// Resolves one placeholder value. A missing `env:NAME` fails the load in
/// production and substitutes an empty string (with a warning) everywhere
/// else. `key_env` names the variable that holds the encryption key used to
/// decrypt `enc:gcm:` envelopes.
fn resolve_secret_placeholder(raw: &str, env_name: &str, key_env: &str) -> Result<String, GatewayError> {
    if let Some(name) = raw.strip_prefix("env:") {
        if std::env::var(name).map(|v| v.starts_with("env:") && v.trim_start_matches("env:") == name).unwrap_or(false) {
            return Err(GatewayError::ConfigCycle(name.to_string()));
        }
        return match std::env::var(name) {
            Ok(value) => Ok(value),
            Err(_) if is_production(env_name) => Err(GatewayError::SecretMissing(name.to_string())),
            Err(_) => {
                tracing::warn!(var = name, "env placeholder not set outside production; substituting empty string");
                Ok(String::new())
            }
        };
    }
    if let Some(envelope) = raw.strip_prefix("enc:gcm:") {
        let secret = crypto::key_from_env(key_env)?;
        return crypto::decrypt(&format!("enc:{envelope}"), &secret);
    }
    Ok(raw.to_string())
}

/// JSON-Schema-subset validation: the structural checks the spec calls out
/// explicitly (non-empty server IDs, uniqueness, a provider reference that
/// actually resolves) rather than a full schema document.
fn validate(config: &MasterConfig) -> Result<(), GatewayError> {
    let mut seen = std::collections::HashSet::new();
    for server in &config.servers {
        if server.id.is_empty() {
            return Err(GatewayError::ConfigSchema("server id must not be empty".to_string()));
        }
        if !seen.insert(server.id.as_str()) {
            return Err(GatewayError::ConfigSchema(format!(
                "duplicate server id '{}'",
                server.id
            )));
        }
        if server.auth_strategy == AuthStrategyConfig::DelegateOauth
            || server.auth_strategy == AuthStrategyConfig::ProxyOauth
        {
            let Some(provider_name) = &server.auth_config.provider else {
                return Err(GatewayError::ConfigSchema(format!(
                    "server '{}' uses {:?} but names no provider",
                    server.id, server.auth_strategy
                )));
            };
            if !config.delegation.providers.contains_key(provider_name)
                && !matches!(provider_name.as_str(), "github" | "google")
            {
                return Err(GatewayError::ConfigSchema(format!(
                    "server '{}' references unknown provider '{}'",
                    server.id, provider_name
                )));
            }
        }
    }
    Ok(())
}

// ── Hot reload ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadClass {
    /// Applied immediately, in place, no component restart required.
    Safe,
    /// Requires a process restart to take effect; a hot reload attempt
    /// carrying one of these is reported but not silently dropped.
    RequiresRestart,
}

#[derive(Debug, Clone)]
pub struct FieldChange {
    pub path: String,
    pub class: ReloadClass,
}

/// Classifies the differences between two configs: `logging.level`,
/// `routing.*`, and `servers[*].auth_*`/topology are safe; `hosting.port`/
/// `hosting.platform` and `security.config_key_env` require a restart.
pub fn classify_changes(previous: &MasterConfig, next: &MasterConfig) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    if previous.logging.level != next.logging.level || previous.logging.format != next.logging.format {
        changes.push(FieldChange {
            path: "logging".to_string(),
            class: ReloadClass::Safe,
        });
    }
    if !routing_eq(&previous.routing, &next.routing) {
        changes.push(FieldChange {
            path: "routing".to_string(),
            class: ReloadClass::Safe,
        });
    }
    if !servers_eq(&previous.servers, &next.servers) {
        changes.push(FieldChange {
            path: "servers".to_string(),
            class: ReloadClass::Safe,
        });
    }
    if previous.hosting.port != next.hosting.port || previous.hosting.platform != next.hosting.platform {
        changes.push(FieldChange {
            path: "hosting.port".to_string(),
            class: ReloadClass::RequiresRestart,
        });
    }
    if previous.security.config_key_env != next.security.config_key_env {
        changes.push(FieldChange {
            path: "security.config_key_env".to_string(),
            class: ReloadClass::RequiresRestart,
        });
    }

    changes
}

fn routing_eq(a: &RoutingConfig, b: &RoutingConfig) -> bool {
    a.load_balancer == b.load_balancer
        && a.circuit_breaker.failure_threshold == b.circuit_breaker.failure_threshold
        && a.circuit_breaker.success_threshold == b.circuit_breaker.success_threshold
        && a.circuit_breaker.recovery_ms == b.circuit_breaker.recovery_ms
        && a.retry.max_retries == b.retry.max_retries
        && a.retry.base_ms == b.retry.base_ms
        && a.retry.max_ms == b.retry.max_ms
}

fn servers_eq(a: &[ServerConfig], b: &[ServerConfig]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_ids: Vec<&str> = a.iter().map(|s| s.id.as_str()).collect();
    let mut b_ids: Vec<&str> = b.iter().map(|s| s.id.as_str()).collect();
    a_ids.sort_unstable();
    b_ids.sort_unstable();
    a_ids == b_ids
}

/// Holds the live config behind a single swappable `Arc` and enforces a
/// two-phase apply: `prepare` validates and rate-limits, `commit` performs
/// the atomic swap. Veto support is just "don't call commit" — `prepare`
/// never mutates `current`.
pub struct ConfigManager {
    current: RwLock<Arc<MasterConfig>>,
    last_applied: RwLock<Option<Instant>>,
}

pub struct PreparedReload {
    pub next: MasterConfig,
    pub changes: Vec<FieldChange>,
}

impl ConfigManager {
    pub fn new(initial: MasterConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            last_applied: RwLock::new(None),
        }
    }

    pub async fn current(&self) -> Arc<MasterConfig> {
        self.current.read().await.clone()
    }

    /// Validates `next` and classifies the diff against the current config,
    /// without mutating anything — callers (or a human operator) may
    /// inspect `PreparedReload::changes` and veto by never calling `commit`.
    pub async fn prepare(&self, next: MasterConfig) -> Result<PreparedReload, GatewayError> {
        validate(&next)?;
        let current = self.current().await;
        let changes = classify_changes(&current, &next);
        Ok(PreparedReload { next, changes })
    }

    /// Applies a prepared reload: swaps `current` under a single write
    /// lock, rate-limited to at most one apply per 500ms (debounce).
    pub async fn commit(&self, prepared: PreparedReload) -> Result<(), GatewayError> {
        {
            let mut last = self.last_applied.write().await;
            if let Some(previous) = *last {
                if previous.elapsed() < MIN_APPLY_INTERVAL {
                    return Err(GatewayError::ConfigSchema(
                        "reload rate limit exceeded (max 1 apply / 500ms)".to_string(),
                    ));
                }
            }
            *last = Some(Instant::now());
        }
        *self.current.write().await = Arc::new(prepared.next);
        Ok(())
    }
}
