//! Core `adapters` crate for abstracting Lightning Network data sources.
//!
//! This crate defines the `NodeAdapter` trait, which outlines the operations the
//! backend needs from the local Lightning node, and provides the concrete LND
//! implementation. It also hosts the clients for the two remote services that
//! complement the node's own view:
//!
//! - [`directory`] - the public channel graph directory, with snapshot caching,
//!   a durable recovery copy and topology analysis ([`graph`]).
//! - [`aggregator`] - the network aggregator API mirroring node/channel shapes.
//!
//! Both REST clients speak through the [`rest::RestTransport`] trait so they can
//! be exercised without a network.

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod aggregator;
pub mod directory;
pub mod errors;
pub mod graph;
pub mod lnd;
pub mod models;
pub mod rest;
pub mod utils;

pub use aggregator::{AggregatorClient, Timeframe};
pub use directory::{CentralityMetric, DirectoryClient, DirectoryOptions, GraphRead};
pub use errors::AdapterError;
pub use graph::{CentralNode, ChannelGraph, PathHop, TopologyReport};
pub use lnd::{LndAdapter, LndConnection};
pub use models::*;
pub use rest::{HttpTransport, RestTransport};

/// Operations the backend needs from a local Lightning node implementation.
#[async_trait]
pub trait NodeAdapter: Send + Sync {
    /// Human readable endpoint, used in health details and logs.
    fn endpoint(&self) -> String;

    async fn get_info(&self) -> Result<NodeInfo, AdapterError>;

    async fn list_channels(&self, filter: ChannelFilter) -> Result<Vec<Channel>, AdapterError>;

    async fn forwarding_history(&self, query: &ForwardingQuery) -> Result<ForwardingHistory, AdapterError>;

    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint, AdapterError>;

    /// Starts a close and returns the closing transaction id once the node
    /// reports it, or `None` if the update stream ended first.
    async fn close_channel(
        &self,
        channel_point: &ChannelPoint,
        force: bool,
        target_conf: u32,
    ) -> Result<Option<String>, AdapterError>;

    async fn update_channel_policy(&self, update: &PolicyUpdate) -> Result<(), AdapterError>;

    async fn rebalance(&self, request: &RebalanceRequest) -> Result<RebalanceOutcome, AdapterError>;

    async fn subscribe_channel_events(&self) -> Result<mpsc::Receiver<ChannelEvent>, AdapterError>;

    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<InvoiceEvent>, AdapterError>;
}
