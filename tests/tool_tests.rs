//! Integration tests for capability aggregation: discovery fan-out,
//! namespace prefixing, and the dotted-name resolution fallback.

use std::sync::Arc;

use mcp_gateway::aggregator::{
    Aggregator, DiscoverySource, PrefixStrategy, RawCapabilities, ResourceDef, ToolDef,
};
use mcp_gateway::error::GatewayError;

struct StubSource {
    caps: std::collections::HashMap<String, RawCapabilities>,
}

#[async_trait::async_trait]
impl DiscoverySource for StubSource {
    async fn fetch_capabilities(&self, server_id: &str) -> Result<RawCapabilities, GatewayError> {
        self.caps
            .get(server_id)
            .cloned()
            .ok_or_else(|| GatewayError::Network("no such stub server".to_string()))
    }
}

fn tool(name: &str) -> ToolDef {
    ToolDef {
        name: name.to_string(),
        description: None,
        input_schema: None,
    }
}

fn resource(uri: &str) -> ResourceDef {
    ResourceDef {
        uri: uri.to_string(),
        name: None,
        description: None,
        mime_type: None,
    }
}

#[tokio::test]
async fn discovered_tools_are_namespaced_by_server_id() {
    let aggregator = Aggregator::new(PrefixStrategy::ServerId);
    let mut caps = std::collections::HashMap::new();
    caps.insert(
        "fs".to_string(),
        RawCapabilities {
            tools: vec![tool("read_file"), tool("write_file")],
            resources: vec![resource("file:///tmp/a.txt")],
        },
    );
    let source = Arc::new(StubSource { caps });

    aggregator.discover(&["fs".to_string()], source).await;

    let mapping = aggregator.resolve_tool("fs.read_file").await.unwrap();
    assert_eq!(mapping.server_id, "fs");
    assert_eq!(mapping.original_name, "read_file");

    let all = aggregator.all_tools().await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn unknown_aggregated_name_falls_back_to_dotted_split() {
    let aggregator = Aggregator::new(PrefixStrategy::ServerId);
    // Nothing discovered yet; resolution still splits on the first dot.
    let mapping = aggregator.resolve_tool("fs.read_file").await.unwrap();
    assert_eq!(mapping.server_id, "fs");
    assert_eq!(mapping.original_name, "read_file");
}

#[tokio::test]
async fn name_without_a_dot_does_not_resolve() {
    let aggregator = Aggregator::new(PrefixStrategy::ServerId);
    assert!(aggregator.resolve_tool("read_file").await.is_none());
}

#[tokio::test]
async fn rediscovery_replaces_the_prior_catalog_atomically() {
    let aggregator = Aggregator::new(PrefixStrategy::ServerId);
    let mut first = std::collections::HashMap::new();
    first.insert(
        "fs".to_string(),
        RawCapabilities {
            tools: vec![tool("old_tool")],
            resources: vec![],
        },
    );
    aggregator
        .discover(&["fs".to_string()], Arc::new(StubSource { caps: first }))
        .await;
    assert!(aggregator.resolve_tool("fs.old_tool").await.is_some());

    let mut second = std::collections::HashMap::new();
    second.insert(
        "fs".to_string(),
        RawCapabilities {
            tools: vec![tool("new_tool")],
            resources: vec![],
        },
    );
    aggregator
        .discover(&["fs".to_string()], Arc::new(StubSource { caps: second }))
        .await;

    let all = aggregator.all_tools().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].1.name, "new_tool");
}

#[tokio::test]
async fn failed_discovery_for_one_server_does_not_affect_others() {
    let aggregator = Aggregator::new(PrefixStrategy::ServerId);
    let mut caps = std::collections::HashMap::new();
    caps.insert(
        "good".to_string(),
        RawCapabilities {
            tools: vec![tool("ok_tool")],
            resources: vec![],
        },
    );
    // "bad" is deliberately absent from the stub's map, so fetch_capabilities
    // errors for it.
    let source = Arc::new(StubSource { caps });

    aggregator
        .discover(&["good".to_string(), "bad".to_string()], source)
        .await;

    assert!(aggregator.resolve_tool("good.ok_tool").await.is_some());
    let all = aggregator.all_tools().await;
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn no_prefix_strategy_uses_the_original_name_verbatim() {
    let aggregator = Aggregator::new(PrefixStrategy::None);
    let mut caps = std::collections::HashMap::new();
    caps.insert(
        "fs".to_string(),
        RawCapabilities {
            tools: vec![tool("read_file")],
            resources: vec![],
        },
    );
    aggregator
        .discover(&["fs".to_string()], Arc::new(StubSource { caps }))
        .await;

    assert!(aggregator.resolve_tool("read_file").await.is_some());
}
