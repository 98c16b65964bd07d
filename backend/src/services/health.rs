//! Periodic health probing of the three data sources.
//!
//! The monitor is the only writer of `HealthRecord`s. Each pass probes every
//! configured source concurrently, under a bounded timeout, and folds the
//! outcome into that source's record:
//!
//! * success: `ok`, failure count reset;
//! * failure: count incremented, `degraded` below the threshold, `error` at it;
//! * no client: `unavailable`.
//!
//! The directory is special-cased: a fresh cached graph is healthy without a
//! network call, and an unreachable directory with any cached graph is only
//! `degraded`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use adapters::utils::value_u64;
use adapters::{AggregatorClient, DirectoryClient, GraphSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::services::node_manager::LocalNodeClient;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Local,
    Directory,
    Aggregator,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Local, SourceId::Directory, SourceId::Aggregator];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Local => "local",
            SourceId::Directory => "directory",
            SourceId::Aggregator => "aggregator",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not probed yet
    Unknown,
    Ok,
    /// Failing, but below the threshold or still backed by a cache
    Degraded,
    Error,
    /// No client configured
    Unavailable,
}

impl HealthStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Ok | HealthStatus::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub source_id: SourceId,
    pub status: HealthStatus,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub details: Value,
}

impl HealthRecord {
    fn new(source_id: SourceId, configured: bool) -> Self {
        Self {
            source_id,
            status: if configured {
                HealthStatus::Unknown
            } else {
                HealthStatus::Unavailable
            },
            last_check_time: None,
            last_error: None,
            consecutive_failures: 0,
            details: json!({}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub sources: BTreeMap<SourceId, HealthRecord>,
    pub global_status: HealthStatus,
}

#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECK_INTERVAL,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Worst status wins: `error`, then `degraded`, then `ok`, else `unknown`.
pub fn global_status<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    let statuses: Vec<HealthStatus> = statuses.into_iter().collect();
    if statuses.contains(&HealthStatus::Error) {
        HealthStatus::Error
    } else if statuses.contains(&HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else if statuses.contains(&HealthStatus::Ok) {
        HealthStatus::Ok
    } else {
        HealthStatus::Unknown
    }
}

enum Outcome {
    Healthy(Value),
    Failed {
        error: String,
        details: Value,
        /// An unreachable source still serving cached data is only degraded.
        cache_available: bool,
    },
}

impl Outcome {
    fn failed(error: String, details: Value) -> Self {
        Outcome::Failed {
            error,
            details,
            cache_available: false,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn cache_details(snapshot: &GraphSnapshot) -> Value {
    json!({
        "nodes_count": snapshot.nodes.len(),
        "channels_count": snapshot.channels.len(),
        "cache_age_hours": snapshot.age().as_secs_f64() / 3600.0,
        "last_update": snapshot.fetched_at,
    })
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    local: Option<Arc<LocalNodeClient>>,
    directory: Option<Arc<DirectoryClient>>,
    aggregator: Option<Arc<AggregatorClient>>,
    options: HealthOptions,
    records: RwLock<BTreeMap<SourceId, HealthRecord>>,
    running: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(
        local: Option<Arc<LocalNodeClient>>,
        directory: Option<Arc<DirectoryClient>>,
        aggregator: Option<Arc<AggregatorClient>>,
        options: HealthOptions,
    ) -> Self {
        let records = [
            HealthRecord::new(SourceId::Local, local.is_some()),
            HealthRecord::new(SourceId::Directory, directory.is_some()),
            HealthRecord::new(SourceId::Aggregator, aggregator.is_some()),
        ]
        .into_iter()
        .map(|r| (r.source_id, r))
        .collect();
        Self {
            local,
            directory,
            aggregator,
            options,
            records: RwLock::new(records),
            running: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &HealthOptions {
        &self.options
    }

    pub async fn record(&self, source: SourceId) -> Option<HealthRecord> {
        self.records.read().await.get(&source).cloned()
    }

    pub async fn status(&self, source: SourceId) -> HealthStatus {
        self.records
            .read()
            .await
            .get(&source)
            .map(|r| r.status)
            .unwrap_or(HealthStatus::Unavailable)
    }

    pub async fn is_available(&self, source: SourceId) -> bool {
        self.status(source).await.is_available()
    }

    pub async fn report(&self) -> HealthReport {
        let sources = self.records.read().await.clone();
        let global_status = global_status(sources.values().map(|r| r.status));
        HealthReport {
            timestamp: Utc::now(),
            sources,
            global_status,
        }
    }

    /// Probes every configured source concurrently and returns the updated report.
    pub async fn check_all(&self) -> HealthReport {
        let (local, directory, aggregator) = tokio::join!(
            self.probe_local(),
            self.probe_directory(),
            self.probe_aggregator()
        );
        for (source, outcome) in [
            (SourceId::Local, local),
            (SourceId::Directory, directory),
            (SourceId::Aggregator, aggregator),
        ] {
            if let Some(outcome) = outcome {
                self.apply(source, outcome).await;
            }
        }
        let report = self.report().await;
        debug!("Health check complete: {:?}", report.global_status);
        report
    }

    /// Probes one source; unconfigured sources keep their `unavailable` record.
    pub async fn check_source(&self, source: SourceId) -> HealthStatus {
        let outcome = match source {
            SourceId::Local => self.probe_local().await,
            SourceId::Directory => self.probe_directory().await,
            SourceId::Aggregator => self.probe_aggregator().await,
        };
        if let Some(outcome) = outcome {
            self.apply(source, outcome).await;
        }
        self.status(source).await
    }

    async fn apply(&self, source: SourceId, outcome: Outcome) {
        let threshold = self.options.failure_threshold;
        let mut records = self.records.write().await;
        let record = records
            .entry(source)
            .or_insert_with(|| HealthRecord::new(source, true));
        record.last_check_time = Some(Utc::now());
        match outcome {
            Outcome::Healthy(details) => {
                if record.status != HealthStatus::Ok && record.status != HealthStatus::Unknown {
                    info!("{} source recovered", source);
                }
                record.status = HealthStatus::Ok;
                record.consecutive_failures = 0;
                record.last_error = None;
                record.details = details;
            }
            Outcome::Failed {
                error,
                details,
                cache_available: true,
            } => {
                warn!("{} source unreachable, serving cached data: {}", source, error);
                record.status = HealthStatus::Degraded;
                record.last_error = Some(error);
                record.details = details;
            }
            Outcome::Failed { error, details, .. } => {
                record.consecutive_failures += 1;
                record.status = if record.consecutive_failures < threshold {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Error
                };
                warn!(
                    "{} health check failed ({}/{}): {}",
                    source, record.consecutive_failures, threshold, error
                );
                record.last_error = Some(error);
                record.details = details;
            }
        }
    }

    async fn bounded<T, E, F>(&self, probe: F) -> Result<T, String>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match tokio::time::timeout(self.options.probe_timeout, probe).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "probe timed out after {}s",
                self.options.probe_timeout.as_secs_f64()
            )),
        }
    }

    async fn probe_local(&self) -> Option<Outcome> {
        let client = self.local.as_ref()?;
        let started = Instant::now();
        Some(match self.bounded(client.get_info()).await {
            Ok(info) => Outcome::Healthy(json!({
                "alias": info.alias,
                "pubkey": info.pubkey,
                "block_height": info.block_height,
                "synced": info.synced_to_chain,
                "response_time_ms": elapsed_ms(started),
            })),
            Err(error) => Outcome::failed(
                error,
                json!({
                    "endpoint": client.endpoint(),
                    "response_time_ms": elapsed_ms(started),
                }),
            ),
        })
    }

    async fn probe_aggregator(&self) -> Option<Outcome> {
        let client = self.aggregator.as_ref()?;
        let started = Instant::now();
        Some(match self.bounded(client.get_network_stats()).await {
            Ok(stats) => Outcome::Healthy(json!({
                "api_url": client.base_url(),
                "has_api_key": client.has_api_key(),
                "network_stats": {
                    "nodes_count": value_u64(&stats, "num_nodes").or_else(|| value_u64(&stats, "nodes_count")),
                    "channels_count": value_u64(&stats, "num_channels").or_else(|| value_u64(&stats, "channels_count")),
                },
                "response_time_ms": elapsed_ms(started),
            })),
            Err(error) => Outcome::failed(
                error,
                json!({
                    "api_url": client.base_url(),
                    "has_api_key": client.has_api_key(),
                    "response_time_ms": elapsed_ms(started),
                }),
            ),
        })
    }

    async fn probe_directory(&self) -> Option<Outcome> {
        let client = self.directory.as_ref()?;
        let cached = client.cached().await;
        if let Some(snapshot) = cached.as_ref().filter(|s| client.is_fresh(s)) {
            return Some(Outcome::Healthy(json!({
                "api_url": client.base_url(),
                "cache_status": "valid",
                "cache_details": cache_details(snapshot),
            })));
        }

        let started = Instant::now();
        let cache = cached.as_deref().map(cache_details);
        Some(match self.bounded(client.get_network_stats()).await {
            Ok(_) => Outcome::Healthy(json!({
                "api_url": client.base_url(),
                "cache_status": "stale or missing",
                "cache_details": cache,
                "response_time_ms": elapsed_ms(started),
            })),
            Err(error) => {
                let cache_available = cached.is_some();
                let error = if cache_available {
                    format!("API unreachable but cache available: {}", error)
                } else {
                    error
                };
                Outcome::Failed {
                    error,
                    details: json!({
                        "api_url": client.base_url(),
                        "cache_status": "stale or missing",
                        "cache_details": cache,
                        "response_time_ms": elapsed_ms(started),
                    }),
                    cache_available,
                }
            }
        })
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Starts periodic probing. The first pass happens one interval from now.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Health monitor already running");
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(monitor.options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_all().await;
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("Health monitor loop exited");
        });

        *running = Some(Running { stop, handle });
        info!(
            "Health monitor started (every {}s, threshold {})",
            self.options.interval.as_secs(),
            self.options.failure_threshold
        );
    }

    /// Cancels the background task and waits for it to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            warn!("Health monitor is not running");
            return;
        };
        let _ = running.stop.send(true);
        if let Err(err) = running.handle.await {
            warn!("Health monitor task ended abnormally: {}", err);
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeNode, FakeTransport};
    use adapters::DirectoryOptions;

    fn graph() -> Value {
        json!({
            "nodes": [{"pub_key": "a"}, {"pub_key": "b"}],
            "channels": [{"channel_id": "ab", "node1_pub": "a", "node2_pub": "b", "capacity": 1000}]
        })
    }

    fn directory(transport: Arc<FakeTransport>, ttl: Duration) -> Arc<DirectoryClient> {
        Arc::new(DirectoryClient::new(
            transport,
            DirectoryOptions {
                graph_ttl: ttl,
                snapshot_path: None,
                ..Default::default()
            },
        ))
    }

    fn local_only(node: Arc<FakeNode>) -> HealthMonitor {
        HealthMonitor::new(
            Some(Arc::new(LocalNodeClient::new(node))),
            None,
            None,
            HealthOptions::default(),
        )
    }

    #[test]
    fn worst_status_wins() {
        use HealthStatus::*;
        assert_eq!(global_status([Ok, Degraded, Error]), Error);
        assert_eq!(global_status([Ok, Degraded, Unavailable]), Degraded);
        assert_eq!(global_status([Ok, Unknown, Unavailable]), Ok);
        assert_eq!(global_status([Unknown, Unavailable]), Unknown);
        assert_eq!(global_status(Vec::<HealthStatus>::new()), Unknown);
    }

    #[tokio::test]
    async fn unconfigured_sources_are_unavailable() {
        let monitor = local_only(Arc::new(FakeNode::default()));
        assert_eq!(monitor.status(SourceId::Local).await, HealthStatus::Unknown);
        assert_eq!(monitor.status(SourceId::Aggregator).await, HealthStatus::Unavailable);

        monitor.check_all().await;
        assert_eq!(monitor.status(SourceId::Aggregator).await, HealthStatus::Unavailable);
        assert_eq!(monitor.status(SourceId::Directory).await, HealthStatus::Unavailable);
    }

    #[tokio::test]
    async fn failures_degrade_then_error_then_recover() {
        let node = Arc::new(FakeNode::default());
        let monitor = local_only(node.clone());

        assert_eq!(monitor.check_source(SourceId::Local).await, HealthStatus::Ok);
        node.set_offline(true);
        assert_eq!(monitor.check_source(SourceId::Local).await, HealthStatus::Degraded);
        assert_eq!(monitor.check_source(SourceId::Local).await, HealthStatus::Degraded);
        assert_eq!(monitor.check_source(SourceId::Local).await, HealthStatus::Error);
        let record = monitor.record(SourceId::Local).await.unwrap();
        assert_eq!(record.consecutive_failures, 3);
        assert!(record.last_error.unwrap().contains("refused"));

        node.set_offline(false);
        assert_eq!(monitor.check_source(SourceId::Local).await, HealthStatus::Ok);
        let record = monitor.record(SourceId::Local).await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.details["synced"], json!(true));
    }

    #[tokio::test]
    async fn fresh_graph_is_healthy_without_a_call() {
        let transport = Arc::new(FakeTransport::default().with("/graph", graph()));
        let directory = directory(transport.clone(), Duration::from_secs(3600));
        directory.get_graph(false).await.unwrap();
        transport.fail(true);

        let monitor = HealthMonitor::new(None, Some(directory), None, HealthOptions::default());
        assert_eq!(monitor.check_source(SourceId::Directory).await, HealthStatus::Ok);
        assert_eq!(transport.hits_for("/stats"), 0);
        let record = monitor.record(SourceId::Directory).await.unwrap();
        assert_eq!(record.details["cache_status"], "valid");
        assert_eq!(record.details["cache_details"]["nodes_count"], 2);
    }

    #[tokio::test]
    async fn unreachable_directory_with_stale_cache_stays_degraded() {
        let transport = Arc::new(FakeTransport::default().with("/graph", graph()));
        let directory = directory(transport.clone(), Duration::ZERO);
        directory.get_graph(false).await.unwrap();
        transport.fail(true);

        let monitor = HealthMonitor::new(None, Some(directory), None, HealthOptions::default());
        for _ in 0..5 {
            assert_eq!(monitor.check_source(SourceId::Directory).await, HealthStatus::Degraded);
        }
        let record = monitor.record(SourceId::Directory).await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_error.unwrap().starts_with("API unreachable but cache available"));
    }

    #[tokio::test]
    async fn unreachable_directory_without_cache_counts_failures() {
        let transport = Arc::new(FakeTransport::default());
        transport.fail(true);
        let monitor = HealthMonitor::new(
            None,
            Some(directory(transport, Duration::from_secs(3600))),
            None,
            HealthOptions {
                failure_threshold: 2,
                ..Default::default()
            },
        );
        assert_eq!(monitor.check_source(SourceId::Directory).await, HealthStatus::Degraded);
        assert_eq!(monitor.check_source(SourceId::Directory).await, HealthStatus::Error);
    }

    #[tokio::test]
    async fn aggregator_check_records_counts() {
        let transport = Arc::new(
            FakeTransport::default()
                .with_api_key()
                .with("/network/stats", json!({"num_nodes": 15000, "num_channels": 60000})),
        );
        let aggregator = Arc::new(AggregatorClient::new(transport));
        let monitor = HealthMonitor::new(None, None, Some(aggregator), HealthOptions::default());

        let report = monitor.check_all().await;
        assert_eq!(report.global_status, HealthStatus::Ok);
        let details = &report.sources[&SourceId::Aggregator].details;
        assert_eq!(details["has_api_key"], true);
        assert_eq!(details["network_stats"]["nodes_count"], 15000);
    }

    #[tokio::test]
    async fn report_serializes_with_lowercase_names() {
        let monitor = local_only(Arc::new(FakeNode::default()));
        monitor.check_all().await;
        let value = serde_json::to_value(monitor.report().await).unwrap();
        assert_eq!(value["global_status"], "ok");
        assert_eq!(value["sources"]["local"]["status"], "ok");
        assert_eq!(value["sources"]["aggregator"]["status"], "unavailable");
    }

    #[tokio::test]
    async fn background_task_checks_until_stopped() {
        let node = Arc::new(FakeNode::default());
        let monitor = Arc::new(HealthMonitor::new(
            Some(Arc::new(LocalNodeClient::new(node.clone()))),
            None,
            None,
            HealthOptions {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        ));

        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running().await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        monitor.stop().await;
        assert!(!monitor.is_running().await);

        let probes = node.calls();
        assert!(probes >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node.calls(), probes);
        monitor.stop().await;
    }
}
