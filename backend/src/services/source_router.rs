//! Chooses which backend answers a request.
//!
//! One `DataSource` per backend kind is created on first use and reused after
//! that. `auto` prefers the aggregator while the health monitor reports it
//! healthy and otherwise settles on the local source, which never fails.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use adapters::{AggregatorClient, DirectoryClient};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::services::data_source::{AggregatorSource, DataSource, LocalSource};
use crate::services::health::{HealthMonitor, HealthStatus, SourceId};
use crate::services::node_manager::LocalNodeClient;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Aggregator,
    #[default]
    Auto,
}

impl FromStr for SourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(SourceKind::Local),
            "aggregator" => Ok(SourceKind::Aggregator),
            "auto" => Ok(SourceKind::Auto),
            other => Err(AppError::Validation(format!(
                "unknown data source {}; expected local, aggregator or auto",
                other
            ))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Local => "local",
            SourceKind::Aggregator => "aggregator",
            SourceKind::Auto => "auto",
        })
    }
}

pub struct SourceRouter {
    node: Option<Arc<LocalNodeClient>>,
    directory: Option<Arc<DirectoryClient>>,
    aggregator: Option<Arc<AggregatorClient>>,
    health: Arc<HealthMonitor>,
    local_source: OnceLock<Arc<dyn DataSource>>,
    aggregator_source: OnceLock<Arc<dyn DataSource>>,
    /// Held for the whole of `initialize` so concurrent callers wait for it.
    running: Mutex<bool>,
}

impl SourceRouter {
    pub fn new(
        node: Option<Arc<LocalNodeClient>>,
        directory: Option<Arc<DirectoryClient>>,
        aggregator: Option<Arc<AggregatorClient>>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            node,
            directory,
            aggregator,
            health,
            local_source: OnceLock::new(),
            aggregator_source: OnceLock::new(),
            running: Mutex::new(false),
        }
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn has_aggregator(&self) -> bool {
        self.aggregator.is_some()
    }

    /// Loads the durable graph, runs one health pass and starts background
    /// probing. Later calls do nothing; calls racing the first one return
    /// once it has finished.
    pub async fn initialize(&self) {
        let mut running = self.running.lock().await;
        if *running {
            debug!("Source router already initialized");
            return;
        }
        if let Some(directory) = &self.directory {
            match directory.warm_start().await {
                Ok(true) => info!("Channel graph restored from disk"),
                Ok(false) => debug!("No usable channel graph on disk"),
                Err(err) => warn!("Could not read channel graph from disk: {}", err),
            }
        }
        let report = self.health.check_all().await;
        info!("Initial health check: {:?}", report.global_status);
        self.health.start().await;
        *running = true;
    }

    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            debug!("Source router not running");
            return;
        }
        self.health.stop().await;
        *running = false;
        info!("Source router shut down");
    }

    fn local(&self) -> Arc<dyn DataSource> {
        self.local_source
            .get_or_init(|| {
                debug!("Creating local data source");
                let source: Arc<dyn DataSource> =
                    Arc::new(LocalSource::new(self.node.clone(), self.directory.clone()));
                source
            })
            .clone()
    }

    fn aggregator(&self) -> Option<Arc<dyn DataSource>> {
        let client = self.aggregator.as_ref()?;
        Some(
            self.aggregator_source
                .get_or_init(|| {
                    debug!("Creating aggregator data source");
                    let source: Arc<dyn DataSource> = Arc::new(AggregatorSource::new(client.clone()));
                    source
                })
                .clone(),
        )
    }

    pub async fn get_data_source(&self, kind: SourceKind) -> AppResult<Arc<dyn DataSource>> {
        match kind {
            SourceKind::Local => Ok(self.local()),
            SourceKind::Aggregator => self
                .aggregator()
                .ok_or_else(|| AppError::Validation("aggregator source is not configured".to_string())),
            SourceKind::Auto => Ok(self.select().await),
        }
    }

    async fn select(&self) -> Arc<dyn DataSource> {
        if let Some(source) = self.aggregator() {
            let healthy = match self.health.status(SourceId::Aggregator).await {
                HealthStatus::Unknown => self.probe_aggregator().await,
                status => status == HealthStatus::Ok,
            };
            if healthy {
                debug!("Routing to aggregator source");
                return source;
            }
        }
        let local_status = self.health.status(SourceId::Local).await;
        if !local_status.is_available() {
            warn!(
                "No healthy data source (local is {:?}); using local source anyway",
                local_status
            );
        }
        self.local()
    }

    /// One-off reachability check used before the first health pass.
    async fn probe_aggregator(&self) -> bool {
        let Some(client) = &self.aggregator else {
            return false;
        };
        let timeout = self.health.options().probe_timeout;
        match tokio::time::timeout(timeout, client.get_network_stats()).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!("Aggregator unreachable: {}", err);
                false
            }
            Err(_) => {
                warn!("Aggregator probe timed out after {}s", timeout.as_secs());
                false
            }
        }
    }
}
