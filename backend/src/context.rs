//! The application context: every client and service, built once and shared.
//!
//! `main` builds one `AppContext` from the settings and hands it to whatever
//! presents the data. Tests build it from fakes with [`AppContext::new`].

use std::sync::Arc;

use adapters::{AggregatorClient, DirectoryClient, HttpTransport, LndAdapter};
use serde_json::Value;
use tracing::info;

use crate::config::Settings;
use crate::errors::{AppError, AppResult};
use crate::services::data_aggregator::{AggregationOptions, NodeAggregator, SyncReport};
use crate::services::data_source::DataSource;
use crate::services::enrichment::{EnrichedChannel, EnrichedNode};
use crate::services::health::{HealthMonitor, HealthOptions, HealthReport};
use crate::services::node_manager::LocalNodeClient;
use crate::services::recommendations::Recommendation;
use crate::services::source_router::{SourceKind, SourceRouter};

pub struct AppContext {
    node: Option<Arc<LocalNodeClient>>,
    directory: Option<Arc<DirectoryClient>>,
    aggregator: Option<Arc<AggregatorClient>>,
    router: Arc<SourceRouter>,
    node_aggregator: NodeAggregator,
}

impl AppContext {
    /// Wires already-built clients together.
    pub fn new(
        node: Option<Arc<LocalNodeClient>>,
        directory: Option<Arc<DirectoryClient>>,
        aggregator: Option<Arc<AggregatorClient>>,
        health: HealthOptions,
        aggregation: AggregationOptions,
    ) -> Self {
        let monitor = Arc::new(HealthMonitor::new(
            node.clone(),
            directory.clone(),
            aggregator.clone(),
            health,
        ));
        let router = Arc::new(SourceRouter::new(
            node.clone(),
            directory.clone(),
            aggregator.clone(),
            monitor,
        ));
        let node_aggregator = NodeAggregator::new(
            node.clone(),
            directory.clone(),
            aggregator.clone(),
            router.clone(),
            aggregation,
        );
        Self {
            node,
            directory,
            aggregator,
            router,
            node_aggregator,
        }
    }

    /// Builds the real clients described by the settings. Nothing is contacted
    /// until [`AppContext::initialize`].
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let node = settings.lnd.as_ref().map(|lnd| {
            let adapter = LndAdapter::new(lnd.connection());
            info!("Local node configured at {}", lnd.host);
            Arc::new(LocalNodeClient::new(Arc::new(adapter)).with_identity(settings.node_pubkey.clone()))
        });

        let directory_transport = HttpTransport::new(
            &settings.directory.api_url,
            settings.directory.api_key.clone(),
            settings.directory.timeout(),
        )?;
        let directory = Arc::new(DirectoryClient::new(
            Arc::new(directory_transport),
            settings.directory.options(),
        ));

        let aggregator = match &settings.aggregator {
            Some(aggregator) => {
                let transport = HttpTransport::new(
                    &aggregator.api_url,
                    aggregator.api_key.clone(),
                    aggregator.timeout(),
                )?;
                info!("Aggregator configured at {}", aggregator.api_url);
                Some(Arc::new(AggregatorClient::new(Arc::new(transport))))
            }
            None => None,
        };

        Ok(Self::new(
            node,
            Some(directory),
            aggregator,
            settings.health.options(),
            settings.aggregation.options(),
        ))
    }

    /// Restores the channel graph from disk, runs the first health pass and
    /// starts background probing.
    pub async fn initialize(&self) {
        self.router.initialize().await;
        info!("Application context ready");
    }

    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.node_aggregator.clear_cache().await;
    }

    pub fn local_node(&self) -> AppResult<&Arc<LocalNodeClient>> {
        self.node
            .as_ref()
            .ok_or_else(|| AppError::Config("local node is not configured".to_string()))
    }

    pub fn directory(&self) -> Option<&Arc<DirectoryClient>> {
        self.directory.as_ref()
    }

    pub fn aggregator(&self) -> Option<&Arc<AggregatorClient>> {
        self.aggregator.as_ref()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        self.router.health()
    }

    pub async fn get_data_source(&self, kind: SourceKind) -> AppResult<Arc<dyn DataSource>> {
        self.router.get_data_source(kind).await
    }

    pub async fn get_health_manager(&self) -> HealthReport {
        self.router.health().report().await
    }

    pub async fn get_enriched_node(&self, pubkey: &str, force_refresh: bool) -> AppResult<Arc<EnrichedNode>> {
        self.node_aggregator.get_enriched_node(pubkey, force_refresh).await
    }

    pub fn get_channel_recommendations(&self, node: &EnrichedNode) -> Vec<Recommendation> {
        self.node_aggregator.get_channel_recommendations(node)
    }

    pub async fn get_enriched_channels(&self, pubkey: Option<&str>) -> AppResult<Vec<EnrichedChannel>> {
        self.node_aggregator.get_enriched_channels(pubkey).await
    }

    pub async fn get_network_context(&self) -> Value {
        self.node_aggregator.get_network_context().await
    }

    pub async fn synchronize(&self, pubkeys: &[String]) -> AppResult<SyncReport> {
        self.node_aggregator.synchronize(pubkeys).await
    }

    pub async fn invalidate(&self, pubkey: &str) -> bool {
        self.node_aggregator.invalidate(pubkey).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::health::{HealthStatus, SourceId};

    #[tokio::test]
    async fn settings_without_optional_sources_build_a_context() {
        let mut settings = Settings::default();
        settings.directory.snapshot_path = String::new();
        let context = AppContext::from_settings(&settings).unwrap();

        assert!(matches!(context.local_node(), Err(AppError::Config(_))));
        assert!(context.aggregator().is_none());
        assert!(context.directory().is_some());

        let report = context.get_health_manager().await;
        assert_eq!(report.sources[&SourceId::Local].status, HealthStatus::Unavailable);
        assert_eq!(report.sources[&SourceId::Directory].status, HealthStatus::Unknown);
        assert!(matches!(
            context.get_data_source(SourceKind::Aggregator).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn configured_sources_are_wired() {
        let mut settings = Settings::from_toml(
            r#"
            node_pubkey = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"

            [lnd]
            host = "127.0.0.1:1"

            [aggregator]
            api_url = "http://127.0.0.1:1"
            "#,
        )
        .unwrap();
        settings.directory.snapshot_path = String::new();
        let context = AppContext::from_settings(&settings).unwrap();

        let node = context.local_node().unwrap();
        assert_eq!(
            node.local_pubkey().await.as_deref(),
            Some("0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798")
        );
        assert!(context.aggregator().is_some());
        assert_eq!(context.get_data_source(SourceKind::Local).await.unwrap().kind(), "local");
    }
}
