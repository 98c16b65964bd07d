//! Client for the network aggregator API.
//!
//! A thin facade: every method is one `GET` returning the service's JSON as-is.
//! Failures are returned to the caller untouched, since every consumer one layer
//! up has another source to fall back on.

use std::sync::Arc;

use serde_json::Value;

use crate::errors::AdapterError;
use crate::rest::RestTransport;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Window accepted by the channel performance endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timeframe {
    Day,
    #[default]
    Week,
    Month,
}

impl Timeframe {
    fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Day => "day",
            Timeframe::Week => "week",
            Timeframe::Month => "month",
        }
    }
}

pub struct AggregatorClient {
    transport: Arc<dyn RestTransport>,
}

fn page(limit: usize, offset: usize) -> [(&'static str, String); 2] {
    [("limit", limit.to_string()), ("offset", offset.to_string())]
}

impl AggregatorClient {
    pub fn new(transport: Arc<dyn RestTransport>) -> Self {
        Self { transport }
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    pub fn has_api_key(&self) -> bool {
        self.transport.has_api_key()
    }

    async fn get(&self, path: &str) -> Result<Value, AdapterError> {
        self.transport.get_json(path, &[]).await
    }

    pub async fn get_network_stats(&self) -> Result<Value, AdapterError> {
        self.get("/network/stats").await
    }

    pub async fn get_network_nodes(&self, limit: usize, offset: usize) -> Result<Value, AdapterError> {
        self.transport.get_json("/network/nodes", &page(limit, offset)).await
    }

    pub async fn get_node_details(&self, node_id: &str) -> Result<Value, AdapterError> {
        self.get(&format!("/network/nodes/{}", node_id)).await
    }

    pub async fn get_node_channels(&self, node_id: &str) -> Result<Value, AdapterError> {
        self.get(&format!("/network/nodes/{}/channels", node_id)).await
    }

    pub async fn get_node_ranking(&self, node_id: &str) -> Result<Value, AdapterError> {
        self.get(&format!("/network/nodes/{}/ranking", node_id)).await
    }

    pub async fn get_node_network_context(&self, node_id: &str) -> Result<Value, AdapterError> {
        self.get(&format!("/network/nodes/{}/context", node_id)).await
    }

    pub async fn get_network_map(&self) -> Result<Value, AdapterError> {
        self.get("/network/map").await
    }

    pub async fn get_network_growth_trends(&self) -> Result<Value, AdapterError> {
        self.get("/network/trends").await
    }

    pub async fn get_channels_stats(&self) -> Result<Value, AdapterError> {
        self.get("/channels/stats").await
    }

    pub async fn get_channels_list(&self, limit: usize, offset: usize) -> Result<Value, AdapterError> {
        self.transport.get_json("/channels/list", &page(limit, offset)).await
    }

    pub async fn get_channel_details(&self, channel_id: &str) -> Result<Value, AdapterError> {
        self.get(&format!("/channels/{}", channel_id)).await
    }

    pub async fn get_channels_performance(&self, timeframe: Timeframe) -> Result<Value, AdapterError> {
        self.transport
            .get_json(
                "/channels/performance",
                &[("timeframe", timeframe.as_str().to_string())],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::fake::FakeTransport;
    use serde_json::json;

    #[tokio::test]
    async fn paginated_listings_send_limit_and_offset() {
        let transport = Arc::new(FakeTransport::default().with("/network/nodes", json!([{"pubkey": "a"}])));
        let aggregator = AggregatorClient::new(transport.clone());

        let nodes = aggregator.get_network_nodes(DEFAULT_PAGE_SIZE, 100).await.unwrap();
        assert_eq!(nodes[0]["pubkey"], "a");
        assert_eq!(transport.last_call().unwrap(), "/network/nodes?limit=50&offset=100");
    }

    #[tokio::test]
    async fn entity_paths_embed_identifiers() {
        let transport = Arc::new(
            FakeTransport::default()
                .with("/network/nodes/02ab/ranking", json!({"rank": 12}))
                .with("/channels/performance", json!({"top": []})),
        );
        let aggregator = AggregatorClient::new(transport.clone());

        assert_eq!(aggregator.get_node_ranking("02ab").await.unwrap()["rank"], 12);
        aggregator.get_channels_performance(Timeframe::default()).await.unwrap();
        assert_eq!(transport.last_call().unwrap(), "/channels/performance?timeframe=week");
    }

    #[tokio::test]
    async fn failures_propagate() {
        let transport = Arc::new(FakeTransport::default());
        let aggregator = AggregatorClient::new(transport.clone());
        assert!(matches!(
            aggregator.get_channel_details("123").await,
            Err(AdapterError::NotFound(_))
        ));
        transport.fail(true);
        assert!(aggregator.get_network_stats().await.unwrap_err().is_transport());
    }
}
