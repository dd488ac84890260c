//! Discovery fan-out, namespace-prefixing, and reverse lookup maps for the
//! combined tool/resource catalog across every backend server.
//!
//! Discovery tries `/capabilities` first and falls back to raw JSON-RPC
//! `tools/list`/`resources/list` against a server's own endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};

use crate::error::GatewayError;

const DEFAULT_DISCOVERY_CONCURRENCY: usize = 16;
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    pub uri: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolMapping {
    pub server_id: String,
    pub original_name: String,
}

#[derive(Debug, Clone)]
pub struct ResourceMapping {
    pub server_id: String,
    pub original_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixStrategy {
    /// `"{serverID}.{original}"` — the default.
    ServerId,
    /// No prefix; original name used verbatim. Requires unique names across
    /// all configured backends or later discoveries silently win.
    None,
}

impl PrefixStrategy {
    pub fn apply(&self, server_id: &str, original: &str) -> String {
        match self {
            Self::ServerId => format!("{server_id}.{original}"),
            Self::None => original.to_string(),
        }
    }
}

/// What the aggregator needs from a backend to discover and call its
/// capabilities. Implemented by `backend::BackendClient` in production;
/// tests supply a stub.
#[async_trait::async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn fetch_capabilities(&self, server_id: &str) -> Result<RawCapabilities, GatewayError>;
}

#[derive(Debug, Clone, Default)]
pub struct RawCapabilities {
    pub tools: Vec<ToolDef>,
    pub resources: Vec<ResourceDef>,
}

struct PerServerCatalog {
    tools: Vec<ToolDef>,
    resources: Vec<ResourceDef>,
}

pub struct Aggregator {
    prefix: PrefixStrategy,
    discovery_concurrency: usize,
    discovery_timeout: Duration,

    catalogs: RwLock<HashMap<String, PerServerCatalog>>,
    tool_map: RwLock<HashMap<String, ToolMapping>>,
    resource_map: RwLock<HashMap<String, ResourceMapping>>,
}

impl Aggregator {
    pub fn new(prefix: PrefixStrategy) -> Self {
        Self {
            prefix,
            discovery_concurrency: DEFAULT_DISCOVERY_CONCURRENCY,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            catalogs: RwLock::new(HashMap::new()),
            tool_map: RwLock::new(HashMap::new()),
            resource_map: RwLock::new(HashMap::new()),
        }
    }

    /// Fan-out discovery across all `server_ids`, bounded to
    /// `discovery_concurrency` concurrent backends, each under its own
    /// timeout. Partial per-server failures are logged and do not abort the
    /// overall pass. `source` is shared via `Arc` so each server's discovery
    /// can run as its own concurrent task.
    pub async fn discover(&self, server_ids: &[String], source: Arc<dyn DiscoverySource>) {
        let semaphore = Arc::new(Semaphore::new(self.discovery_concurrency));
        let mut join_set = tokio::task::JoinSet::new();

        for server_id in server_ids {
            let server_id = server_id.clone();
            let source = source.clone();
            let semaphore = semaphore.clone();
            let timeout = self.discovery_timeout;

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let result = tokio::time::timeout(timeout, source.fetch_capabilities(&server_id)).await;
                (server_id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((server_id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(caps)) => self.replace_server(&server_id, caps).await,
                Ok(Err(err)) => {
                    tracing::warn!(server_id = %server_id, error = %err, "capability discovery failed");
                }
                Err(_timeout) => {
                    tracing::warn!(server_id = %server_id, "capability discovery timed out");
                }
            }
        }
    }

    /// Atomically replaces one server's entries: prior entries are removed
    /// from both maps *before* the new ones are inserted.
    async fn replace_server(&self, server_id: &str, caps: RawCapabilities) {
        {
            let mut tool_map = self.tool_map.write().await;
            tool_map.retain(|_, mapping| mapping.server_id != server_id);
            for tool in &caps.tools {
                let aggregated = self.prefix.apply(server_id, &tool.name);
                tool_map.insert(
                    aggregated,
                    ToolMapping {
                        server_id: server_id.to_string(),
                        original_name: tool.name.clone(),
                    },
                );
            }
        }
        {
            let mut resource_map = self.resource_map.write().await;
            resource_map.retain(|_, mapping| mapping.server_id != server_id);
            for resource in &caps.resources {
                let aggregated = self.prefix.apply(server_id, &resource.uri);
                resource_map.insert(
                    aggregated,
                    ResourceMapping {
                        server_id: server_id.to_string(),
                        original_uri: resource.uri.clone(),
                    },
                );
            }
        }

        self.catalogs.write().await.insert(
            server_id.to_string(),
            PerServerCatalog {
                tools: caps.tools,
                resources: caps.resources,
            },
        );
    }

    /// `ResolveTool`, with the spec's fallback: if the aggregated name isn't
    /// found, split at the first `.` into `(serverID, originalName)` (spec
    /// §4.11 step 1).
    pub async fn resolve_tool(&self, aggregated: &str) -> Option<ToolMapping> {
        if let Some(mapping) = self.tool_map.read().await.get(aggregated) {
            return Some(mapping.clone());
        }
        aggregated.split_once('.').map(|(server_id, original)| ToolMapping {
            server_id: server_id.to_string(),
            original_name: original.to_string(),
        })
    }

    pub async fn resolve_resource(&self, aggregated: &str) -> Option<ResourceMapping> {
        if let Some(mapping) = self.resource_map.read().await.get(aggregated) {
            return Some(mapping.clone());
        }
        aggregated.split_once('.').map(|(server_id, original)| ResourceMapping {
            server_id: server_id.to_string(),
            original_uri: original.to_string(),
        })
    }

    pub async fn all_tools(&self) -> Vec<(String, ToolDef)> {
        let catalogs = self.catalogs.read().await;
        let mut out = Vec::new();
        for (server_id, catalog) in catalogs.iter() {
            for tool in &catalog.tools {
                let aggregated = self.prefix.apply(server_id, &tool.name);
                out.push((
                    aggregated,
                    ToolDef {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: tool.input_schema.clone(),
                    },
                ));
            }
        }
        out
    }

    pub async fn all_resources(&self) -> Vec<(String, ResourceDef)> {
        let catalogs = self.catalogs.read().await;
        let mut out = Vec::new();
        for (server_id, catalog) in catalogs.iter() {
            for resource in &catalog.resources {
                let aggregated = self.prefix.apply(server_id, &resource.uri);
                out.push((
                    aggregated,
                    ResourceDef {
                        uri: resource.uri.clone(),
                        name: resource.name.clone(),
                        description: resource.description.clone(),
                        mime_type: resource.mime_type.clone(),
                    },
                ));
            }
        }
        out
    }
}
