//! The read contract every data backend offers, and its two implementations.
//!
//! `LocalSource` answers from the local node, falling back to the directory
//! API and then to the cached channel graph. It never fails: a backend error
//! becomes an empty list, `None`, or an error-tagged stats document.
//! `AggregatorSource` forwards to the aggregator API and lets transport errors
//! through, since the router and the node aggregator always have a fallback.
//!
//! Every document carries a `source` tag naming where it came from.

use std::sync::Arc;

use adapters::{AggregatorClient, Channel, ChannelDescriptor, ChannelFilter, DirectoryClient, NodeDescriptor};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::services::node_manager::LocalNodeClient;

pub const SOURCE_LOCAL: &str = "local";
pub const SOURCE_DIRECTORY: &str = "directory";
pub const SOURCE_LOCAL_GRAPH: &str = "local_graph";
pub const SOURCE_AGGREGATOR: &str = "aggregator";

const DEFAULT_NODE_COLOR: &str = "#000000";

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Backend name, `local` or `aggregator`.
    fn kind(&self) -> &'static str;

    /// `{node: {...}, source}` or `None` when no backend knows the node.
    async fn get_node_info(&self, pubkey: &str) -> AppResult<Option<Value>>;

    /// `{channel: {...}, source}` or `None` when no backend knows the channel.
    async fn get_channel_info(&self, channel_id: &str) -> AppResult<Option<Value>>;

    async fn get_network_stats(&self) -> AppResult<Value>;

    async fn get_network_nodes(&self, limit: usize, offset: usize) -> AppResult<Vec<Value>>;

    async fn get_node_details(&self, pubkey: &str) -> AppResult<Option<Value>>;

    async fn get_channels_stats(&self) -> AppResult<Value>;

    async fn get_channels_list(&self, limit: usize, offset: usize) -> AppResult<Vec<Value>>;

    async fn get_channel_details(&self, channel_id: &str) -> AppResult<Option<Value>>;

    async fn get_node_channels(&self, pubkey: &str) -> AppResult<Vec<Value>>;
}

/// Adds the `source` tag to an object, wrapping anything else under `data`.
pub fn tag(value: Value, source: &str) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert("source".to_string(), Value::String(source.to_string()));
            Value::Object(map)
        }
        other => json!({ "data": other, "source": source }),
    }
}

fn absorb<T: Default>(operation: &str, result: AppResult<T>) -> T {
    result.unwrap_or_else(|err| {
        debug!("{} unavailable from local source: {}", operation, err);
        T::default()
    })
}

fn avg(total: u64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

fn graph_node(node: &NodeDescriptor) -> Value {
    json!({
        "pubkey": node.pub_key,
        "alias": node.alias,
        "color": if node.color.is_empty() { DEFAULT_NODE_COLOR } else { node.color.as_str() },
        "addresses": node.addresses,
        "last_update": node.last_update,
    })
}

fn graph_channel(channel: &ChannelDescriptor) -> Value {
    json!({
        "channel_id": channel.channel_id,
        "node1_pub": channel.node1_pub,
        "node2_pub": channel.node2_pub,
        "capacity": channel.capacity,
        "last_update": channel.last_update,
    })
}

fn own_channel(own: &str, channel: &Channel) -> Value {
    json!({
        "channel_id": channel.channel_id,
        "channel_point": channel.channel_point,
        "node1_pub": own,
        "node2_pub": channel.remote_pubkey,
        "capacity": channel.capacity,
        "active": channel.active,
        "private": channel.private,
        "local_balance": channel.local_balance,
        "remote_balance": channel.remote_balance,
        "source": SOURCE_LOCAL,
    })
}

/// Local node first, then the directory API, then the cached graph.
pub struct LocalSource {
    node: Option<Arc<LocalNodeClient>>,
    directory: Option<Arc<DirectoryClient>>,
}

impl LocalSource {
    pub fn new(node: Option<Arc<LocalNodeClient>>, directory: Option<Arc<DirectoryClient>>) -> Self {
        Self { node, directory }
    }

    fn node(&self) -> AppResult<&LocalNodeClient> {
        self.node
            .as_deref()
            .ok_or_else(|| AppError::Config("local node is not configured".to_string()))
    }

    /// Our own pubkey, when the node is configured and reachable.
    async fn own_pubkey(&self) -> Option<String> {
        self.node().ok()?.resolve_pubkey().await.ok()
    }

    async fn own_channels(&self) -> AppResult<(String, Vec<Channel>)> {
        let node = self.node()?;
        let own = node.resolve_pubkey().await?;
        let channels = node.list_channels(ChannelFilter::default()).await?;
        Ok((own, channels))
    }

    async fn directory_lookup(&self, path: Lookup<'_>) -> Option<Value> {
        let directory = self.directory.as_ref()?;
        let result = match path {
            Lookup::Node(pubkey) => directory.get_node(pubkey).await,
            Lookup::Channel(channel_id) => directory.get_channel(channel_id).await,
        };
        result
            .map_err(|err| debug!("Directory lookup failed: {}", err))
            .ok()
    }

    async fn snapshot(&self) -> Option<Arc<adapters::GraphSnapshot>> {
        let directory = self.directory.as_ref()?;
        match directory.get_graph(false).await {
            Ok(read) => Some(read.snapshot),
            Err(err) => {
                debug!("Channel graph unavailable: {}", err);
                None
            }
        }
    }

    async fn find_own_channel(&self, channel_id: &str) -> Option<(String, Channel)> {
        let (own, channels) = self.own_channels().await.ok()?;
        channels
            .into_iter()
            .find(|c| c.channel_id == channel_id)
            .map(|c| (own, c))
    }
}

enum Lookup<'a> {
    Node(&'a str),
    Channel(&'a str),
}

#[async_trait]
impl DataSource for LocalSource {
    fn kind(&self) -> &'static str {
        SOURCE_LOCAL
    }

    async fn get_node_info(&self, pubkey: &str) -> AppResult<Option<Value>> {
        if self.own_pubkey().await.as_deref() == Some(pubkey) {
            if let Ok(info) = self.node()?.get_info().await {
                return Ok(Some(json!({
                    "node": {
                        "pubkey": info.pubkey,
                        "alias": info.alias,
                        "color": info.color,
                        "addresses": info.uris,
                        "last_update": Value::Null,
                    },
                    "source": SOURCE_LOCAL,
                })));
            }
        }
        if let Some(node) = self.directory_lookup(Lookup::Node(pubkey)).await {
            return Ok(Some(json!({ "node": node, "source": SOURCE_DIRECTORY })));
        }
        let snapshot = self.snapshot().await;
        Ok(snapshot
            .as_ref()
            .and_then(|s| s.nodes.get(pubkey))
            .map(|node| json!({ "node": graph_node(node), "source": SOURCE_LOCAL_GRAPH })))
    }

    async fn get_channel_info(&self, channel_id: &str) -> AppResult<Option<Value>> {
        if let Some((own, channel)) = self.find_own_channel(channel_id).await {
            return Ok(Some(json!({
                "channel": {
                    "channel_id": channel.channel_id,
                    "node1_pub": own,
                    "node2_pub": channel.remote_pubkey,
                    "capacity": channel.capacity,
                    "last_update": Value::Null,
                },
                "source": SOURCE_LOCAL,
            })));
        }
        if let Some(channel) = self.directory_lookup(Lookup::Channel(channel_id)).await {
            return Ok(Some(json!({ "channel": channel, "source": SOURCE_DIRECTORY })));
        }
        let snapshot = self.snapshot().await;
        Ok(snapshot
            .as_ref()
            .and_then(|s| s.channels.get(channel_id))
            .map(|c| json!({ "channel": graph_channel(c), "source": SOURCE_LOCAL_GRAPH })))
    }

    async fn get_network_stats(&self) -> AppResult<Value> {
        let timestamp = Utc::now();
        let info = match self.node() {
            Ok(node) => node.get_info().await,
            Err(err) => Err(err),
        };
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                return Ok(json!({
                    "timestamp": timestamp,
                    "error": err.to_string(),
                    "source": SOURCE_LOCAL,
                }))
            }
        };
        let network = self.snapshot().await.map(|s| {
            json!({
                "num_nodes": s.nodes.len(),
                "num_channels": s.channels.len(),
                "total_capacity": s.total_capacity(),
                "avg_channel_size": avg(s.total_capacity(), s.channels.len()),
                "graph_updated_at": s.fetched_at,
            })
        });
        Ok(json!({
            "timestamp": timestamp,
            "node_stats": {
                "alias": info.alias,
                "pubkey": info.pubkey,
                "num_active_channels": info.num_active_channels,
                "num_inactive_channels": info.num_inactive_channels,
                "num_pending_channels": info.num_pending_channels,
                "block_height": info.block_height,
            },
            "network_stats": network,
            "source": SOURCE_LOCAL,
        }))
    }

    async fn get_network_nodes(&self, limit: usize, offset: usize) -> AppResult<Vec<Value>> {
        let Some(snapshot) = self.snapshot().await else {
            return Ok(Vec::new());
        };
        Ok(snapshot
            .nodes
            .values()
            .skip(offset)
            .take(limit)
            .map(|node| {
                let mut value = graph_node(node);
                value["degree"] = json!(snapshot.node_channels(&node.pub_key).count());
                tag(value, SOURCE_LOCAL_GRAPH)
            })
            .collect())
    }

    async fn get_node_details(&self, pubkey: &str) -> AppResult<Option<Value>> {
        if self.own_pubkey().await.as_deref() == Some(pubkey) {
            if let Ok(info) = self.node()?.get_info().await {
                let value = serde_json::to_value(&info).map_err(|err| AppError::Transport(err.to_string()))?;
                return Ok(Some(tag(value, SOURCE_LOCAL)));
            }
        }
        if let Some(node) = self.directory_lookup(Lookup::Node(pubkey)).await {
            return Ok(Some(tag(node, SOURCE_DIRECTORY)));
        }
        let snapshot = self.snapshot().await;
        Ok(snapshot.as_ref().and_then(|s| {
            s.nodes.get(pubkey).map(|node| {
                let mut value = graph_node(node);
                value["num_channels"] = json!(s.node_channels(pubkey).count());
                tag(value, SOURCE_LOCAL_GRAPH)
            })
        }))
    }

    async fn get_channels_stats(&self) -> AppResult<Value> {
        let timestamp = Utc::now();
        let channels = match self.own_channels().await {
            Ok((_, channels)) => channels,
            Err(err) => {
                return Ok(json!({
                    "timestamp": timestamp,
                    "error": err.to_string(),
                    "source": SOURCE_LOCAL,
                }))
            }
        };
        let active = channels.iter().filter(|c| c.active).count();
        let total_capacity: u64 = channels.iter().map(|c| c.capacity).sum();
        let network = self.snapshot().await.map(|s| {
            json!({
                "total_channels": s.channels.len(),
                "total_capacity": s.total_capacity(),
                "avg_capacity": avg(s.total_capacity(), s.channels.len()),
            })
        });
        Ok(json!({
            "timestamp": timestamp,
            "local_stats": {
                "total_channels": channels.len(),
                "active_channels": active,
                "inactive_channels": channels.len() - active,
                "total_capacity": total_capacity,
                "avg_capacity": avg(total_capacity, channels.len()),
            },
            "network_stats": network,
            "source": SOURCE_LOCAL,
        }))
    }

    async fn get_channels_list(&self, limit: usize, offset: usize) -> AppResult<Vec<Value>> {
        let (own, channels) = absorb("channel list", self.own_channels().await);
        Ok(channels
            .iter()
            .skip(offset)
            .take(limit)
            .map(|c| own_channel(&own, c))
            .collect())
    }

    async fn get_channel_details(&self, channel_id: &str) -> AppResult<Option<Value>> {
        if let Some((own, channel)) = self.find_own_channel(channel_id).await {
            let mut value = serde_json::to_value(&channel).map_err(|err| AppError::Transport(err.to_string()))?;
            if let Value::Object(map) = &mut value {
                map.insert("node1_pub".to_string(), Value::String(own));
                map.insert("node2_pub".to_string(), Value::String(channel.remote_pubkey.clone()));
            }
            return Ok(Some(tag(value, SOURCE_LOCAL)));
        }
        if let Some(channel) = self.directory_lookup(Lookup::Channel(channel_id)).await {
            return Ok(Some(tag(channel, SOURCE_DIRECTORY)));
        }
        let snapshot = self.snapshot().await;
        Ok(snapshot
            .as_ref()
            .and_then(|s| s.channels.get(channel_id))
            .map(|c| tag(graph_channel(c), SOURCE_LOCAL_GRAPH)))
    }

    async fn get_node_channels(&self, pubkey: &str) -> AppResult<Vec<Value>> {
        if self.own_pubkey().await.as_deref() == Some(pubkey) {
            if let Ok((own, channels)) = self.own_channels().await {
                return Ok(channels.iter().map(|c| own_channel(&own, c)).collect());
            }
        }
        let Some(snapshot) = self.snapshot().await else {
            return Ok(Vec::new());
        };
        Ok(snapshot
            .node_channels(pubkey)
            .map(|c| tag(graph_channel(c), SOURCE_LOCAL_GRAPH))
            .collect())
    }
}

/// Forwards to the aggregator API; errors other than "not found" propagate.
pub struct AggregatorSource {
    client: Arc<AggregatorClient>,
}

impl AggregatorSource {
    pub fn new(client: Arc<AggregatorClient>) -> Self {
        Self { client }
    }
}

fn found(result: Result<Value, adapters::AdapterError>) -> AppResult<Option<Value>> {
    match result {
        Ok(value) if value.is_null() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(adapters::AdapterError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// The array in a listing payload: the payload itself, or its `key` field.
fn items(value: Value, key: &str) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove(key).or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn tagged(values: Vec<Value>) -> Vec<Value> {
    values.into_iter().map(|v| tag(v, SOURCE_AGGREGATOR)).collect()
}

#[async_trait]
impl DataSource for AggregatorSource {
    fn kind(&self) -> &'static str {
        SOURCE_AGGREGATOR
    }

    async fn get_node_info(&self, pubkey: &str) -> AppResult<Option<Value>> {
        Ok(found(self.client.get_node_details(pubkey).await)?
            .map(|node| json!({ "node": node, "source": SOURCE_AGGREGATOR })))
    }

    async fn get_channel_info(&self, channel_id: &str) -> AppResult<Option<Value>> {
        Ok(found(self.client.get_channel_details(channel_id).await)?
            .map(|channel| json!({ "channel": channel, "source": SOURCE_AGGREGATOR })))
    }

    async fn get_network_stats(&self) -> AppResult<Value> {
        Ok(tag(self.client.get_network_stats().await?, SOURCE_AGGREGATOR))
    }

    async fn get_network_nodes(&self, limit: usize, offset: usize) -> AppResult<Vec<Value>> {
        let value = self.client.get_network_nodes(limit, offset).await?;
        Ok(tagged(items(value, "nodes")))
    }

    async fn get_node_details(&self, pubkey: &str) -> AppResult<Option<Value>> {
        Ok(found(self.client.get_node_details(pubkey).await)?.map(|v| tag(v, SOURCE_AGGREGATOR)))
    }

    async fn get_channels_stats(&self) -> AppResult<Value> {
        Ok(tag(self.client.get_channels_stats().await?, SOURCE_AGGREGATOR))
    }

    async fn get_channels_list(&self, limit: usize, offset: usize) -> AppResult<Vec<Value>> {
        let value = self.client.get_channels_list(limit, offset).await?;
        Ok(tagged(items(value, "channels")))
    }

    async fn get_channel_details(&self, channel_id: &str) -> AppResult<Option<Value>> {
        Ok(found(self.client.get_channel_details(channel_id).await)?.map(|v| tag(v, SOURCE_AGGREGATOR)))
    }

    async fn get_node_channels(&self, pubkey: &str) -> AppResult<Vec<Value>> {
        let value = self.client.get_node_channels(pubkey).await?;
        Ok(tagged(items(value, "channels")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{channel, FakeNode, FakeTransport, LOCAL_PUBKEY, PEER_A, PEER_B};
    use adapters::DirectoryOptions;

    fn graph() -> Value {
        json!({
            "nodes": [
                {"pub_key": PEER_A, "alias": "peer-a", "color": "#ff0000"},
                {"pub_key": PEER_B, "alias": "peer-b"}
            ],
            "channels": [
                {"channel_id": "900", "node1_pub": PEER_A, "node2_pub": PEER_B, "capacity": 4_000_000}
            ]
        })
    }

    fn local(node: Arc<FakeNode>, directory: Arc<FakeTransport>) -> LocalSource {
        LocalSource::new(
            Some(Arc::new(LocalNodeClient::new(node))),
            Some(Arc::new(DirectoryClient::new(
                directory,
                DirectoryOptions {
                    snapshot_path: None,
                    ..Default::default()
                },
            ))),
        )
    }

    #[tokio::test]
    async fn own_node_is_answered_locally() {
        let source = local(Arc::new(FakeNode::default()), Arc::new(FakeTransport::default()));
        let info = source.get_node_info(LOCAL_PUBKEY).await.unwrap().unwrap();
        assert_eq!(info["source"], SOURCE_LOCAL);
        assert_eq!(info["node"]["alias"], "local-node");
    }

    #[tokio::test]
    async fn other_nodes_fall_back_to_directory_then_graph() {
        let directory = Arc::new(
            FakeTransport::default()
                .with("/graph", graph())
                .with(&format!("/nodes/{}", PEER_A), json!({"pub_key": PEER_A, "alias": "from-api"})),
        );
        let source = local(Arc::new(FakeNode::default()), directory);

        let a = source.get_node_info(PEER_A).await.unwrap().unwrap();
        assert_eq!(a["source"], SOURCE_DIRECTORY);
        assert_eq!(a["node"]["alias"], "from-api");

        let b = source.get_node_details(PEER_B).await.unwrap().unwrap();
        assert_eq!(b["source"], SOURCE_LOCAL_GRAPH);
        assert_eq!(b["color"], DEFAULT_NODE_COLOR);
        assert_eq!(b["num_channels"], 1);

        assert!(source.get_node_info("03unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_failures_are_absorbed() {
        let node = Arc::new(FakeNode::default().with_channels(vec![channel("1", PEER_A, 1_000_000, 400_000)]));
        let directory = Arc::new(FakeTransport::default());
        directory.fail(true);
        node.set_offline(true);
        let source = local(node, directory);

        assert!(source.get_channels_list(10, 0).await.unwrap().is_empty());
        assert!(source.get_network_nodes(10, 0).await.unwrap().is_empty());
        let stats = source.get_network_stats().await.unwrap();
        assert!(stats["error"].as_str().unwrap().contains("refused"));
        assert_eq!(stats["source"], SOURCE_LOCAL);
    }

    #[tokio::test]
    async fn channel_stats_and_listing_come_from_the_node() {
        let node = Arc::new(FakeNode::default().with_channels(vec![
            channel("1", PEER_A, 1_000_000, 400_000),
            channel("2", PEER_B, 3_000_000, 0),
            adapters::Channel {
                active: false,
                ..channel("3", PEER_B, 2_000_000, 1_000_000)
            },
        ]));
        let source = local(node, Arc::new(FakeTransport::default().with("/graph", graph())));

        let stats = source.get_channels_stats().await.unwrap();
        assert_eq!(stats["local_stats"]["total_channels"], 3);
        assert_eq!(stats["local_stats"]["inactive_channels"], 1);
        assert_eq!(stats["local_stats"]["avg_capacity"], 2_000_000.0);
        assert_eq!(stats["network_stats"]["total_capacity"], 4_000_000);

        let page = source.get_channels_list(1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["channel_id"], "2");
        assert_eq!(page[0]["node1_pub"], LOCAL_PUBKEY);

        let details = source.get_channel_details("1").await.unwrap().unwrap();
        assert_eq!(details["node2_pub"], PEER_A);
        let graph_only = source.get_channel_info("900").await.unwrap().unwrap();
        assert_eq!(graph_only["source"], SOURCE_LOCAL_GRAPH);
        assert_eq!(source.get_node_channels(PEER_A).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn aggregator_errors_propagate_but_missing_is_none() {
        let transport = Arc::new(
            FakeTransport::default()
                .with("/network/nodes", json!({"nodes": [{"pubkey": PEER_A}, {"pubkey": PEER_B}]}))
                .with("/channels/list", json!([{"channel_id": "7"}])),
        );
        let source = AggregatorSource::new(Arc::new(AggregatorClient::new(transport.clone())));

        let nodes = source.get_network_nodes(10, 0).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["source"], SOURCE_AGGREGATOR);
        assert_eq!(source.get_channels_list(10, 0).await.unwrap()[0]["channel_id"], "7");
        assert!(source.get_channel_details("42").await.unwrap().is_none());

        transport.fail(true);
        assert!(source.get_network_stats().await.unwrap_err().is_transport());
    }

    #[test]
    fn tag_wraps_non_objects() {
        assert_eq!(tag(json!({"a": 1}), "x"), json!({"a": 1, "source": "x"}));
        assert_eq!(tag(json!([1]), "x"), json!({"data": [1], "source": "x"}));
    }
}
