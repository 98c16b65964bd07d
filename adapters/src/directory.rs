//! Client for the public channel-graph directory.
//!
//! The full graph is expensive to download, so the client keeps the last good
//! `GraphSnapshot` in memory and refreshes it only once it is older than the
//! configured TTL (or when asked to). Every successful download is also written
//! to a durable file which acts as a recovery log: it is read back at startup
//! and whenever the directory cannot be reached and nothing is held in memory.
//!
//! A refresh that fails, or that returns an empty graph, never replaces the
//! snapshot being served; the caller instead receives the previous one flagged
//! as stale.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::AdapterError;
use crate::graph::{ChannelGraph, PathHop, TopologyReport};
use crate::models::{GraphPayload, GraphSnapshot};
use crate::rest::RestTransport;

pub const DEFAULT_GRAPH_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_SNAPSHOT_PATH: &str = "data/directory_graph_cache.json";

#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub graph_ttl: Duration,
    /// Where the durable copy lives; `None` disables it.
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_max_age: Duration,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        Self {
            graph_ttl: DEFAULT_GRAPH_TTL,
            snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            snapshot_max_age: DEFAULT_SNAPSHOT_MAX_AGE,
        }
    }
}

/// A served graph and whether it is past its TTL.
#[derive(Debug, Clone)]
pub struct GraphRead {
    pub snapshot: Arc<GraphSnapshot>,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralityMetric {
    Betweenness,
    Degree,
    Eigenvector,
    Closeness,
}

impl CentralityMetric {
    fn as_str(&self) -> &'static str {
        match self {
            CentralityMetric::Betweenness => "betweenness",
            CentralityMetric::Degree => "degree",
            CentralityMetric::Eigenvector => "eigenvector",
            CentralityMetric::Closeness => "closeness",
        }
    }
}

impl std::str::FromStr for CentralityMetric {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "betweenness" => Ok(CentralityMetric::Betweenness),
            "degree" => Ok(CentralityMetric::Degree),
            "eigenvector" => Ok(CentralityMetric::Eigenvector),
            "closeness" => Ok(CentralityMetric::Closeness),
            other => Err(AdapterError::Validation(format!(
                "unknown centrality metric {}; expected betweenness, degree, eigenvector or closeness",
                other
            ))),
        }
    }
}

/// On-disk layout of the durable snapshot.
#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    timestamp: DateTime<Utc>,
    graph: GraphPayload,
}

pub struct DirectoryClient {
    transport: Arc<dyn RestTransport>,
    options: DirectoryOptions,
    snapshot: RwLock<Option<Arc<GraphSnapshot>>>,
    refresh: Mutex<()>,
}

fn require(value: &str, what: &str) -> Result<(), AdapterError> {
    if value.trim().is_empty() {
        return Err(AdapterError::Validation(format!("{} is required", what)));
    }
    Ok(())
}

impl DirectoryClient {
    pub fn new(transport: Arc<dyn RestTransport>, options: DirectoryOptions) -> Self {
        Self {
            transport,
            options,
            snapshot: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    pub fn graph_ttl(&self) -> Duration {
        self.options.graph_ttl
    }

    pub fn is_fresh(&self, snapshot: &GraphSnapshot) -> bool {
        snapshot.age() < self.options.graph_ttl
    }

    /// The snapshot currently held in memory, without any network access.
    pub async fn cached(&self) -> Option<Arc<GraphSnapshot>> {
        self.snapshot.read().await.clone()
    }

    async fn publish(&self, snapshot: Arc<GraphSnapshot>) {
        *self.snapshot.write().await = Some(snapshot);
    }

    fn read(&self, snapshot: Arc<GraphSnapshot>) -> GraphRead {
        let stale = !self.is_fresh(&snapshot);
        GraphRead { snapshot, stale }
    }

    /// Returns the channel graph, downloading it when the cached one has
    /// expired or `force_refresh` is set.
    pub async fn get_graph(&self, force_refresh: bool) -> Result<GraphRead, AdapterError> {
        if !force_refresh {
            if let Some(snapshot) = self.cached().await.filter(|s| self.is_fresh(s)) {
                debug!("Serving cached channel graph ({} nodes)", snapshot.nodes.len());
                return Ok(GraphRead { snapshot, stale: false });
            }
        }

        // one download at a time; late arrivals reuse what the first one fetched
        let _guard = self.refresh.lock().await;
        if !force_refresh {
            if let Some(snapshot) = self.cached().await.filter(|s| self.is_fresh(s)) {
                return Ok(GraphRead { snapshot, stale: false });
            }
        }

        match self.fetch_graph().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                info!(
                    "Fetched channel graph: {} nodes, {} channels",
                    snapshot.nodes.len(),
                    snapshot.channels.len()
                );
                self.publish(snapshot.clone()).await;
                if let Err(err) = self.persist(&snapshot).await {
                    warn!("Could not write graph snapshot: {}", err);
                }
                Ok(GraphRead { snapshot, stale: false })
            }
            Err(err) => self.fallback(err).await,
        }
    }

    async fn fetch_graph(&self) -> Result<GraphSnapshot, AdapterError> {
        let raw = self.transport.get_json("/graph", &[]).await?;
        let payload: GraphPayload = serde_json::from_value(raw)?;
        let snapshot = GraphSnapshot::from_payload(payload, Utc::now());
        if snapshot.is_empty() {
            return Err(AdapterError::Parse("directory returned an empty graph".to_string()));
        }
        Ok(snapshot)
    }

    async fn fallback(&self, err: AdapterError) -> Result<GraphRead, AdapterError> {
        if let Some(snapshot) = self.cached().await {
            warn!(
                "Graph refresh failed ({}); serving snapshot from {}",
                err, snapshot.fetched_at
            );
            return Ok(self.read(snapshot));
        }
        match self.load_persisted().await {
            Ok(Some(snapshot)) => {
                warn!(
                    "Graph refresh failed ({}); recovered snapshot from {}",
                    err, snapshot.fetched_at
                );
                self.publish(snapshot.clone()).await;
                Ok(self.read(snapshot))
            }
            Ok(None) => Err(err),
            Err(disk_err) => {
                warn!("Graph snapshot unreadable: {}", disk_err);
                Err(err)
            }
        }
    }

    /// Loads the durable snapshot if there is one no older than the configured
    /// maximum age.
    pub async fn load_persisted(&self) -> Result<Option<Arc<GraphSnapshot>>, AdapterError> {
        let Some(path) = &self.options.snapshot_path else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let persisted: PersistedGraph = serde_json::from_slice(&bytes)?;
        let age = (Utc::now() - persisted.timestamp).to_std().unwrap_or_default();
        if age > self.options.snapshot_max_age {
            debug!("Graph snapshot at {} is too old ({}s)", path.display(), age.as_secs());
            return Ok(None);
        }
        let snapshot = GraphSnapshot::from_payload(persisted.graph, persisted.timestamp);
        if snapshot.is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(snapshot)))
    }

    /// Seeds the in-memory snapshot from disk so the first reads do not wait
    /// for a download. Returns whether anything was loaded.
    pub async fn warm_start(&self) -> Result<bool, AdapterError> {
        if self.cached().await.is_some() {
            return Ok(false);
        }
        match self.load_persisted().await? {
            Some(snapshot) => {
                info!(
                    "Loaded graph snapshot from {} ({} nodes)",
                    snapshot.fetched_at,
                    snapshot.nodes.len()
                );
                self.publish(snapshot).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn persist(&self, snapshot: &GraphSnapshot) -> Result<(), AdapterError> {
        let Some(path) = &self.options.snapshot_path else {
            return Ok(());
        };
        let body = serde_json::to_vec(&PersistedGraph {
            timestamp: snapshot.fetched_at,
            graph: snapshot.to_payload(),
        })?;
        write_atomically(path, &body).await
    }

    pub async fn get_node(&self, pubkey: &str) -> Result<Value, AdapterError> {
        require(pubkey, "node pubkey")?;
        self.transport.get_json(&format!("/nodes/{}", pubkey), &[]).await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Value, AdapterError> {
        require(channel_id, "channel id")?;
        self.transport.get_json(&format!("/channels/{}", channel_id), &[]).await
    }

    pub async fn get_network_stats(&self) -> Result<Value, AdapterError> {
        self.transport.get_json("/stats", &[]).await
    }

    /// Routes computed by the directory itself.
    pub async fn get_routes(
        &self,
        source: &str,
        destination: &str,
        amount_sat: Option<u64>,
    ) -> Result<Value, AdapterError> {
        require(source, "source pubkey")?;
        require(destination, "destination pubkey")?;
        let mut query = vec![("source", source.to_string()), ("destination", destination.to_string())];
        if let Some(amount) = amount_sat.filter(|a| *a > 0) {
            query.push(("amount", amount.to_string()));
        }
        self.transport.get_json("/routes", &query).await
    }

    pub async fn get_key_nodes(&self, limit: usize, metric: CentralityMetric) -> Result<Value, AdapterError> {
        self.transport
            .get_json(
                "/nodes/key",
                &[("limit", limit.to_string()), ("metric", metric.as_str().to_string())],
            )
            .await
    }

    pub async fn convert_to_graph(&self) -> Result<ChannelGraph, AdapterError> {
        let read = self.get_graph(false).await?;
        Ok(ChannelGraph::from_snapshot(&read.snapshot))
    }

    pub async fn analyze_topology(&self) -> Result<TopologyReport, AdapterError> {
        Ok(self.convert_to_graph().await?.analyze())
    }

    pub async fn find_path(&self, source: &str, target: &str) -> Result<Vec<PathHop>, AdapterError> {
        require(source, "source pubkey")?;
        require(target, "target pubkey")?;
        self.convert_to_graph().await?.shortest_path(source, target)
    }
}

async fn write_atomically(path: &Path, body: &[u8]) -> Result<(), AdapterError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
