//! Logic for collecting, merging and caching per-node data from every source.
//!
//! `NodeAggregator` asks the local node (only for our own identity), the
//! directory and the aggregator about a node concurrently, merges whatever
//! came back in a fixed order, and caches the result for a TTL. One source
//! failing leaves its raw payload empty; the enrichment as a whole only fails
//! when no source at all knows the node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adapters::utils::value_u64;
use adapters::{
    AggregatorClient, Channel, ChannelFilter, DirectoryClient, ForwardingEvent, ForwardingQuery, TopologyReport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::services::enrichment::{EnrichedChannel, EnrichedNode, RemoteSource};
use crate::services::node_manager::LocalNodeClient;
use crate::services::recommendations::{self, Recommendation};
use crate::services::source_router::{SourceKind, SourceRouter};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_FORWARDING_DAYS: u32 = 30;
pub const DEFAULT_MAX_FORWARDING_EVENTS: u32 = 1000;
/// Central nodes reported in the network context.
const CONTEXT_TOP_NODES: usize = 10;

#[derive(Debug, Clone)]
pub struct AggregationOptions {
    pub cache_ttl: Duration,
    pub forwarding_days: u32,
    pub max_forwarding_events: u32,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            forwarding_days: DEFAULT_FORWARDING_DAYS,
            max_forwarding_events: DEFAULT_MAX_FORWARDING_EVENTS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub failures: BTreeMap<String, String>,
}

struct CachedNode {
    node: Arc<EnrichedNode>,
    expires_at: Instant,
}

struct LocalView {
    info: Value,
    channels: Vec<Channel>,
    forwards: Vec<ForwardingEvent>,
}

pub struct NodeAggregator {
    node: Option<Arc<LocalNodeClient>>,
    directory: Option<Arc<DirectoryClient>>,
    aggregator: Option<Arc<AggregatorClient>>,
    router: Arc<SourceRouter>,
    options: AggregationOptions,
    cache: RwLock<HashMap<String, CachedNode>>,
}

impl NodeAggregator {
    pub fn new(
        node: Option<Arc<LocalNodeClient>>,
        directory: Option<Arc<DirectoryClient>>,
        aggregator: Option<Arc<AggregatorClient>>,
        router: Arc<SourceRouter>,
        options: AggregationOptions,
    ) -> Self {
        Self {
            node,
            directory,
            aggregator,
            router,
            options,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn cached(&self, pubkey: &str) -> Option<Arc<EnrichedNode>> {
        let cache = self.cache.read().await;
        cache
            .get(pubkey)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.node.clone())
    }

    /// Drops one cached node; returns whether there was one.
    pub async fn invalidate(&self, pubkey: &str) -> bool {
        self.cache.write().await.remove(pubkey).is_some()
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    async fn local_pubkey(&self) -> AppResult<String> {
        match &self.node {
            Some(node) => node.resolve_pubkey().await,
            None => Err(AppError::Config("local node is not configured".to_string())),
        }
    }

    pub async fn get_enriched_node(&self, pubkey: &str, force_refresh: bool) -> AppResult<Arc<EnrichedNode>> {
        if pubkey.trim().is_empty() {
            return Err(AppError::Validation("node pubkey is required".to_string()));
        }
        if !force_refresh {
            if let Some(node) = self.cached(pubkey).await {
                debug!("Serving enriched node {} from cache", pubkey);
                return Ok(node);
            }
        }

        let node = Arc::new(self.enrich(pubkey).await?);
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            pubkey.to_string(),
            CachedNode {
                node: node.clone(),
                expires_at: now + self.options.cache_ttl,
            },
        );
        Ok(node)
    }

    async fn enrich(&self, pubkey: &str) -> AppResult<EnrichedNode> {
        let is_local = self.local_pubkey().await.ok().as_deref() == Some(pubkey);
        let (local, directory, aggregator) = tokio::join!(
            self.query_local(is_local),
            self.query_directory(pubkey),
            self.query_aggregator(pubkey)
        );

        let mut node = EnrichedNode::new(pubkey);
        if let Some(view) = local {
            node.apply_local(view.info, &view.channels, &view.forwards);
        }
        if let Some(payload) = directory {
            node.apply_remote(RemoteSource::Directory, payload, None);
        }
        if let Some((payload, channels)) = aggregator {
            node.apply_remote(RemoteSource::Aggregator, payload, channels.as_ref());
        }

        if !node.is_known() {
            match self.fallback_lookup(pubkey).await {
                Some(found) => {
                    let details = found.get("node").cloned().unwrap_or(Value::Null);
                    let source = if found["source"] == "aggregator" {
                        RemoteSource::Aggregator
                    } else {
                        RemoteSource::Directory
                    };
                    node.apply_remote(source, details, None);
                }
                None => return Err(AppError::NotFound(format!("node {}", pubkey))),
            }
        }

        node.resolve_identity();
        self.label_peers(&mut node).await;
        node.recompute();
        info!(
            "Enriched node {} ({} channels, sources: local={} directory={} aggregator={})",
            pubkey,
            node.channels.len(),
            node.local_data.is_some(),
            node.directory_data.is_some(),
            node.aggregator_data.is_some()
        );
        Ok(node)
    }

    async fn query_local(&self, is_local: bool) -> Option<LocalView> {
        if !is_local {
            return None;
        }
        let node = self.node.as_ref()?;
        let query = ForwardingQuery::last_days(
            i64::from(self.options.forwarding_days),
            self.options.max_forwarding_events,
        );
        let (info, channels, forwards) = tokio::join!(
            node.get_info(),
            node.list_channels(ChannelFilter::default()),
            node.forwarding_history(&query)
        );
        let info = match info {
            Ok(info) => serde_json::to_value(info).ok()?,
            Err(err) => {
                warn!("Local node unavailable for enrichment: {}", err);
                return None;
            }
        };
        let channels = channels.unwrap_or_else(|err| {
            warn!("Could not list local channels: {}", err);
            Vec::new()
        });
        let forwards = forwards.map(|h| h.events).unwrap_or_else(|err| {
            warn!("Could not read forwarding history: {}", err);
            Vec::new()
        });
        Some(LocalView {
            info,
            channels,
            forwards,
        })
    }

    async fn query_directory(&self, pubkey: &str) -> Option<Value> {
        let directory = self.directory.as_ref()?;
        match directory.get_node(pubkey).await {
            Ok(payload) if !payload.is_null() => Some(payload),
            Ok(_) => None,
            Err(err) => {
                debug!("Directory has nothing on {}: {}", pubkey, err);
                None
            }
        }
    }

    async fn query_aggregator(&self, pubkey: &str) -> Option<(Value, Option<Value>)> {
        let aggregator = self.aggregator.as_ref()?;
        let (details, channels) = tokio::join!(
            aggregator.get_node_details(pubkey),
            aggregator.get_node_channels(pubkey)
        );
        match details {
            Ok(payload) if !payload.is_null() => Some((payload, channels.ok())),
            Ok(_) => None,
            Err(err) => {
                debug!("Aggregator has nothing on {}: {}", pubkey, err);
                None
            }
        }
    }

    /// Auto-selected source first, then local, then the aggregator.
    async fn fallback_lookup(&self, pubkey: &str) -> Option<Value> {
        let mut tried: Vec<&'static str> = Vec::new();
        for kind in [SourceKind::Auto, SourceKind::Local, SourceKind::Aggregator] {
            let Ok(source) = self.router.get_data_source(kind).await else {
                continue;
            };
            if tried.contains(&source.kind()) {
                continue;
            }
            tried.push(source.kind());
            match source.get_node_info(pubkey).await {
                Ok(Some(found)) => {
                    debug!("Found {} through the {} source", pubkey, source.kind());
                    return Some(found);
                }
                Ok(None) => {}
                Err(err) => debug!("{} source lookup of {} failed: {}", source.kind(), pubkey, err),
            }
        }
        None
    }

    /// Fills peer aliases from the cached channel graph, without any download.
    async fn label_peers(&self, node: &mut EnrichedNode) {
        let Some(directory) = &self.directory else {
            return;
        };
        let Some(snapshot) = directory.cached().await else {
            return;
        };
        for channel in node.channels.values_mut() {
            if let Some(peer) = snapshot.nodes.get(&channel.node2_pub) {
                if !peer.alias.is_empty() {
                    channel.peer_alias = Some(peer.alias.clone());
                }
            }
        }
    }

    /// Channels of a node, defaulting to the local one.
    pub async fn get_enriched_channels(&self, pubkey: Option<&str>) -> AppResult<Vec<EnrichedChannel>> {
        let pubkey = match pubkey {
            Some(pubkey) => pubkey.to_string(),
            None => self.local_pubkey().await?,
        };
        let node = self.get_enriched_node(&pubkey, false).await?;
        Ok(node.channels.values().cloned().collect())
    }

    pub fn get_channel_recommendations(&self, node: &EnrichedNode) -> Vec<Recommendation> {
        recommendations::get_channel_recommendations(node)
    }

    /// Network-wide figures from the aggregator and the directory plus the
    /// topology summary. Failures are reported inside the document.
    pub async fn get_network_context(&self) -> Value {
        match self.network_context().await {
            Ok(context) => context,
            Err(err) => {
                warn!("Could not build network context: {}", err);
                json!({ "timestamp": Utc::now(), "error": err.to_string() })
            }
        }
    }

    async fn network_context(&self) -> AppResult<Value> {
        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| AppError::Config("directory is not configured".to_string()))?;

        let aggregator_stats = match &self.aggregator {
            Some(aggregator) => Some(aggregator.get_network_stats().await?),
            None => None,
        };
        let directory_stats = directory.get_network_stats().await?;
        let graph = directory.convert_to_graph().await?;
        let topology: TopologyReport = tokio::task::spawn_blocking(move || graph.analyze())
            .await
            .map_err(|err| AppError::Transport(format!("topology analysis aborted: {}", err)))?;

        let number = |value: &Value, key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let aggregator = aggregator_stats.map(|stats| {
            json!({
                "num_nodes": value_u64(&stats, "num_nodes").unwrap_or(0),
                "num_channels": value_u64(&stats, "num_channels").unwrap_or(0),
                "total_capacity": value_u64(&stats, "total_capacity").unwrap_or(0),
                "avg_capacity_per_channel": number(&stats, "avg_capacity_per_channel"),
                "avg_capacity_per_node": number(&stats, "avg_capacity_per_node"),
            })
        });
        let top_nodes: Vec<_> = topology
            .top_betweenness_nodes
            .iter()
            .take(CONTEXT_TOP_NODES)
            .collect();

        Ok(json!({
            "timestamp": Utc::now(),
            "aggregator": aggregator,
            "directory": {
                "num_nodes": value_u64(&directory_stats, "num_nodes").unwrap_or(topology.num_nodes as u64),
                "num_channels": value_u64(&directory_stats, "num_channels").unwrap_or(topology.num_channels as u64),
                "total_capacity": value_u64(&directory_stats, "total_capacity").unwrap_or(0),
                "network_diameter": topology.network_diameter,
                "density": topology.density,
                "avg_degree": topology.avg_degree,
                "largest_component_ratio": topology.largest_component_ratio,
            },
            "top_nodes": top_nodes,
        }))
    }

    /// Re-enriches each node bypassing the cache; defaults to the local node.
    pub async fn synchronize(&self, pubkeys: &[String]) -> AppResult<SyncReport> {
        let pubkeys = if pubkeys.is_empty() {
            vec![self.local_pubkey().await?]
        } else {
            pubkeys.to_vec()
        };
        let mut report = SyncReport {
            timestamp: Utc::now(),
            total: pubkeys.len(),
            successful: 0,
            failed: 0,
            failures: BTreeMap::new(),
        };
        for pubkey in pubkeys {
            match self.get_enriched_node(&pubkey, true).await {
                Ok(_) => report.successful += 1,
                Err(err) => {
                    warn!("Synchronization of {} failed: {}", pubkey, err);
                    report.failed += 1;
                    report.failures.insert(pubkey, err.to_string());
                }
            }
        }
        info!(
            "Synchronized {}/{} nodes",
            report.successful, report.total
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::health::{HealthMonitor, HealthOptions};
    use crate::test_support::{channel, forward, FakeNode, FakeTransport, LOCAL_PUBKEY, PEER_A, PEER_B};
    use adapters::DirectoryOptions;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        aggregator: NodeAggregator,
        node: Arc<FakeNode>,
        directory: Arc<FakeTransport>,
        remote: Arc<FakeTransport>,
    }

    fn fixture() -> Fixture {
        let now = Utc::now();
        let fake = Arc::new(
            FakeNode::default()
                .with_channels(vec![
                    channel("100", PEER_A, 1_000_000, 600_000),
                    channel("200", PEER_B, 2_000_000, 1_000_000),
                ])
                .with_forwards(vec![forward("200", "100", 50_000, 25, now - ChronoDuration::days(1))]),
        );
        let directory_transport = Arc::new(
            FakeTransport::default()
                .with(
                    "/graph",
                    json!({
                        "nodes": [
                            {"pub_key": LOCAL_PUBKEY, "alias": "me"},
                            {"pub_key": PEER_A, "alias": "alice"},
                            {"pub_key": PEER_B, "alias": "bob"}
                        ],
                        "channels": [
                            {"channel_id": "100", "node1_pub": LOCAL_PUBKEY, "node2_pub": PEER_A, "capacity": 1_000_000},
                            {"channel_id": "200", "node1_pub": LOCAL_PUBKEY, "node2_pub": PEER_B, "capacity": 2_000_000}
                        ]
                    }),
                )
                .with("/stats", json!({"num_nodes": 3, "num_channels": 2, "total_capacity": 3_000_000}))
                .with(&format!("/nodes/{}", PEER_A), json!({"pub_key": PEER_A, "alias": "alice-dir"})),
        );
        let remote = Arc::new(
            FakeTransport::default()
                .with("/network/stats", json!({"num_nodes": 15000, "num_channels": 60000}))
                .with(
                    &format!("/network/nodes/{}", PEER_A),
                    json!({"alias": "alice-agg", "color": "#00ff00"}),
                ),
        );

        let node = Some(Arc::new(LocalNodeClient::new(fake.clone())));
        let directory = Some(Arc::new(DirectoryClient::new(
            directory_transport.clone(),
            DirectoryOptions {
                snapshot_path: None,
                ..Default::default()
            },
        )));
        let aggregator = Some(Arc::new(AggregatorClient::new(remote.clone())));
        let health = Arc::new(HealthMonitor::new(
            node.clone(),
            directory.clone(),
            aggregator.clone(),
            HealthOptions::default(),
        ));
        let router = Arc::new(SourceRouter::new(
            node.clone(),
            directory.clone(),
            aggregator.clone(),
            health,
        ));
        Fixture {
            aggregator: NodeAggregator::new(node, directory, aggregator, router, AggregationOptions::default()),
            node: fake,
            directory: directory_transport,
            remote,
        }
    }

    #[tokio::test]
    async fn local_node_is_enriched_from_its_own_data() {
        let f = fixture();
        let node = f.aggregator.get_enriched_node(LOCAL_PUBKEY, false).await.unwrap();
        assert_eq!(node.alias.as_deref(), Some("local-node"));
        assert_eq!(node.channels.len(), 2);
        assert_eq!(node.channels["200"].profitability.revenue, 25);
        assert_eq!(node.channels["100"].forwarding_stats.total_forwards, 1);
        assert!(node.local_data.is_some());
        assert!(node.directory_data.is_none());
    }

    #[tokio::test]
    async fn cache_serves_until_forced_or_invalidated() {
        let f = fixture();
        let first = f.aggregator.get_enriched_node(LOCAL_PUBKEY, false).await.unwrap();
        let calls = f.node.calls();
        let second = f.aggregator.get_enriched_node(LOCAL_PUBKEY, false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.node.calls(), calls);

        let forced = f.aggregator.get_enriched_node(LOCAL_PUBKEY, true).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &forced));
        assert!(f.aggregator.invalidate(LOCAL_PUBKEY).await);
        assert!(!f.aggregator.invalidate(LOCAL_PUBKEY).await);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_the_next_insert() {
        let mut f = fixture();
        f.aggregator.options.cache_ttl = Duration::ZERO;
        f.aggregator.get_enriched_node(LOCAL_PUBKEY, false).await.unwrap();
        f.aggregator.get_enriched_node(PEER_A, false).await.unwrap();

        let cache = f.aggregator.cache.read().await;
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key(PEER_A));
    }

    #[tokio::test]
    async fn remote_node_merges_directory_over_aggregator() {
        let f = fixture();
        let node = f.aggregator.get_enriched_node(PEER_A, false).await.unwrap();
        assert_eq!(node.alias.as_deref(), Some("alice-dir"));
        assert_eq!(node.color.as_deref(), Some("#00ff00"));
        assert!(node.local_data.is_none());
        assert!(node.channels.is_empty());
    }

    #[tokio::test]
    async fn one_failing_source_does_not_fail_the_node() {
        let f = fixture();
        f.remote.fail(true);
        let node = f.aggregator.get_enriched_node(PEER_A, false).await.unwrap();
        assert_eq!(node.alias.as_deref(), Some("alice-dir"));
        assert!(node.aggregator_data.is_none());
    }

    #[tokio::test]
    async fn graph_only_nodes_are_found_through_the_fallback_chain() {
        let f = fixture();
        let node = f.aggregator.get_enriched_node(PEER_B, false).await.unwrap();
        assert_eq!(node.alias.as_deref(), Some("bob"));
        assert!(f.directory.hits_for("/graph") >= 1);
    }

    #[tokio::test]
    async fn unknown_everywhere_is_not_found() {
        let f = fixture();
        let unknown = "03".to_string() + &"11".repeat(32);
        assert!(matches!(
            f.aggregator.get_enriched_node(&unknown, false).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn peers_are_labelled_from_the_cached_graph() {
        let f = fixture();
        f.aggregator.get_network_context().await;
        let channels = f.aggregator.get_enriched_channels(None).await.unwrap();
        let alice = channels.iter().find(|c| c.channel_id == "100").unwrap();
        assert_eq!(alice.peer_alias.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn network_context_combines_both_services() {
        let f = fixture();
        let context = f.aggregator.get_network_context().await;
        assert_eq!(context["aggregator"]["num_nodes"], 15000);
        assert_eq!(context["directory"]["num_channels"], 2);
        assert_eq!(context["directory"]["network_diameter"], 2);
        assert!(context["top_nodes"].as_array().unwrap().len() <= CONTEXT_TOP_NODES);

        f.remote.fail(true);
        let context = f.aggregator.get_network_context().await;
        assert!(context["error"].is_string());
    }

    #[tokio::test]
    async fn synchronize_reports_each_node() {
        let f = fixture();
        let report = f.aggregator.synchronize(&[]).await.unwrap();
        assert_eq!((report.total, report.successful), (1, 1));

        let unknown = "03".to_string() + &"22".repeat(32);
        let report = f
            .aggregator
            .synchronize(&[PEER_A.to_string(), unknown.clone()])
            .await
            .unwrap();
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert!(report.failures.contains_key(&unknown));
    }
}
