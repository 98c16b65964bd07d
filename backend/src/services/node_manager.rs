//! Manages the connection to, and interactions with, the local Lightning node.
//!
//! `LocalNodeClient` wraps a `NodeAdapter` (LND in production) and is the only
//! way the rest of the backend talks to the node. Parameter checks happen here
//! before anything reaches the wire. Transport and authentication failures are
//! returned as ordinary `Err` values and recorded (last error and consecutive
//! failure count) so the health monitor and callers can see the node degrading
//! without anything panicking.

use std::sync::Arc;

use adapters::{
    AdapterError, Channel, ChannelEvent, ChannelFilter, ChannelPoint, ForwardingHistory, ForwardingQuery,
    InvoiceEvent, NodeAdapter, NodeInfo, OpenChannelRequest, PolicyUpdate, RebalanceOutcome, RebalanceRequest,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::AppResult;

/// Confirmation target used for cooperative closes when none is given.
pub const DEFAULT_CLOSE_TARGET_CONF: u32 = 6;

#[derive(Debug, Default, Clone)]
struct ConnectionState {
    last_error: Option<String>,
    consecutive_failures: u32,
}

pub struct LocalNodeClient {
    adapter: Arc<dyn NodeAdapter>,
    identity: RwLock<Option<String>>,
    state: Mutex<ConnectionState>,
}

impl LocalNodeClient {
    pub fn new(adapter: Arc<dyn NodeAdapter>) -> Self {
        Self {
            adapter,
            identity: RwLock::new(None),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    /// Pins the node identity up front instead of learning it from `get_info`.
    pub fn with_identity(self, pubkey: Option<String>) -> Self {
        Self {
            identity: RwLock::new(pubkey),
            ..self
        }
    }

    pub fn endpoint(&self) -> String {
        self.adapter.endpoint()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Identity of the local node, if configured or already learned.
    pub async fn local_pubkey(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    /// Identity of the local node, asking the node when it is not known yet.
    pub async fn resolve_pubkey(&self) -> AppResult<String> {
        if let Some(pubkey) = self.local_pubkey().await {
            return Ok(pubkey);
        }
        Ok(self.get_info().await?.pubkey)
    }

    async fn track<T>(&self, operation: &str, result: Result<T, AdapterError>) -> AppResult<T> {
        match result {
            Ok(value) => {
                let mut state = self.state.lock().await;
                state.consecutive_failures = 0;
                Ok(value)
            }
            Err(err) => {
                if err.is_transport() {
                    let mut state = self.state.lock().await;
                    state.consecutive_failures += 1;
                    state.last_error = Some(err.to_string());
                    warn!(
                        "{} on local node failed ({} in a row): {}",
                        operation, state.consecutive_failures, err
                    );
                } else {
                    debug!("{} on local node rejected: {}", operation, err);
                }
                Err(err.into())
            }
        }
    }

    pub async fn get_info(&self) -> AppResult<NodeInfo> {
        let info = self.track("GetInfo", self.adapter.get_info().await).await?;
        let mut identity = self.identity.write().await;
        match identity.as_deref() {
            None => {
                info!("Connected to local node {} ({})", info.alias, info.pubkey);
                *identity = Some(info.pubkey.clone());
            }
            Some(known) if known != info.pubkey => {
                warn!(
                    "Configured node identity {} differs from the node's own {}",
                    known, info.pubkey
                );
            }
            Some(_) => {}
        }
        Ok(info)
    }

    pub async fn list_channels(&self, filter: ChannelFilter) -> AppResult<Vec<Channel>> {
        filter.validate()?;
        self.track("ListChannels", self.adapter.list_channels(filter).await).await
    }

    pub async fn forwarding_history(&self, query: &ForwardingQuery) -> AppResult<ForwardingHistory> {
        query.validate()?;
        self.track("ForwardingHistory", self.adapter.forwarding_history(query).await)
            .await
    }

    pub async fn open_channel(&self, request: &OpenChannelRequest) -> AppResult<ChannelPoint> {
        request.validate()?;
        let point = self.track("OpenChannel", self.adapter.open_channel(request).await).await?;
        info!(
            "Opened channel {} to {} ({} sat)",
            point, request.node_pubkey, request.local_funding_amount
        );
        Ok(point)
    }

    /// Closes a channel, returning the closing transaction id when the node
    /// reports one. `target_conf` defaults to six blocks.
    pub async fn close_channel(
        &self,
        channel_point: &str,
        force: bool,
        target_conf: Option<u32>,
    ) -> AppResult<Option<String>> {
        let point: ChannelPoint = channel_point.parse()?;
        let target_conf = target_conf.unwrap_or(DEFAULT_CLOSE_TARGET_CONF);
        let txid = self
            .track(
                "CloseChannel",
                self.adapter.close_channel(&point, force, target_conf).await,
            )
            .await?;
        info!("Closing channel {} (force: {}): {:?}", point, force, txid);
        Ok(txid)
    }

    pub async fn update_channel_policy(&self, update: &PolicyUpdate) -> AppResult<()> {
        update.validate()?;
        self.track(
            "UpdateChannelPolicy",
            self.adapter.update_channel_policy(update).await,
        )
        .await
    }

    pub async fn rebalance(&self, request: &RebalanceRequest) -> AppResult<RebalanceOutcome> {
        request.validate()?;
        let outcome = self.track("Rebalance", self.adapter.rebalance(request).await).await?;
        if outcome.success {
            info!(
                "Rebalanced {} sat for {} sat in fees",
                request.amount_sat, outcome.total_fees
            );
        } else {
            warn!("Rebalance of {} sat failed: {:?}", request.amount_sat, outcome.error);
        }
        Ok(outcome)
    }

    pub async fn subscribe_channel_events(&self) -> AppResult<mpsc::Receiver<ChannelEvent>> {
        self.track(
            "SubscribeChannelEvents",
            self.adapter.subscribe_channel_events().await,
        )
        .await
    }

    pub async fn subscribe_invoices(&self) -> AppResult<mpsc::Receiver<InvoiceEvent>> {
        self.track("SubscribeInvoices", self.adapter.subscribe_invoices().await)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::test_support::{FakeNode, PEER_A};

    #[tokio::test]
    async fn conflicting_filters_never_reach_the_node() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());
        let both = ChannelFilter {
            active_only: true,
            inactive_only: true,
        };
        assert!(matches!(
            client.list_channels(both).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(node.calls(), 0);
    }

    #[tokio::test]
    async fn transport_failures_are_recorded_and_reset() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());

        node.set_offline(true);
        assert!(client.get_info().await.unwrap_err().is_transport());
        assert!(client.get_info().await.is_err());
        assert_eq!(client.consecutive_failures().await, 2);
        assert!(client.last_error().await.unwrap().contains("refused"));

        node.set_offline(false);
        let info = client.get_info().await.unwrap();
        assert_eq!(client.consecutive_failures().await, 0);
        assert_eq!(client.local_pubkey().await, Some(info.pubkey));
    }

    #[tokio::test]
    async fn rebalance_requires_channels_on_both_sides() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());
        let request = RebalanceRequest::new(vec![], vec!["2".into()], 50_000);
        assert!(matches!(
            client.rebalance(&request).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(node.calls(), 0);
    }

    #[tokio::test]
    async fn close_parses_the_channel_point() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());
        assert!(matches!(
            client.close_channel("garbage", false, None).await,
            Err(AppError::Validation(_))
        ));
        let point = format!("{}:0", "ab".repeat(32));
        let txid = client.close_channel(&point, false, None).await.unwrap();
        assert_eq!(txid.as_deref(), Some("closing-tx"));
        assert_eq!(node.last_close_target(), Some(DEFAULT_CLOSE_TARGET_CONF));
    }

    #[tokio::test]
    async fn configured_identity_is_used_without_a_round_trip() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone()).with_identity(Some("02cafe".into()));
        assert_eq!(client.resolve_pubkey().await.unwrap(), "02cafe");
        assert_eq!(node.calls(), 0);
    }

    #[tokio::test]
    async fn open_channel_rejects_bad_requests_locally() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());

        let zero = OpenChannelRequest::new(PEER_A, 0);
        let overpushed = OpenChannelRequest {
            push_sat: 100_000,
            ..OpenChannelRequest::new(PEER_A, 100_000)
        };
        let bad_key = OpenChannelRequest::new("nope", 100_000);
        for request in [zero, overpushed, bad_key] {
            assert!(matches!(
                client.open_channel(&request).await,
                Err(AppError::Validation(_))
            ));
        }
        assert_eq!(node.calls(), 0);

        let point = client
            .open_channel(&OpenChannelRequest::new(PEER_A, 100_000))
            .await
            .unwrap();
        assert_eq!(point.funding_txid, "cd".repeat(32));
        assert_eq!(point.output_index, 1);
        assert_eq!(node.calls(), 1);
    }

    #[tokio::test]
    async fn empty_policy_update_is_rejected() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());
        let point: ChannelPoint = format!("{}:0", "ab".repeat(32)).parse().unwrap();
        let mut update = PolicyUpdate {
            channel_point: point,
            base_fee_msat: None,
            fee_rate_ppm: None,
            time_lock_delta: None,
        };
        assert!(matches!(
            client.update_channel_policy(&update).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(node.calls(), 0);

        update.fee_rate_ppm = Some(250);
        client.update_channel_policy(&update).await.unwrap();
        assert_eq!(node.calls(), 1);
    }

    #[tokio::test]
    async fn settled_rebalance_reports_fees() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());
        let request = RebalanceRequest::new(vec!["1".into()], vec!["2".into()], 50_000);
        let outcome = client.rebalance(&request).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.total_fees, 3);
        assert_eq!(outcome.total_amt, 50_003);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn channel_events_arrive_in_order_until_the_stream_ends() {
        let events = vec![
            ChannelEvent::PendingOpen {
                txid: "cd".repeat(32),
                output_index: 1,
            },
            ChannelEvent::Opened {
                channel_id: "7".into(),
                remote_pubkey: PEER_A.into(),
                capacity: 100_000,
            },
            ChannelEvent::Active {
                channel_point: format!("{}:1", "cd".repeat(32)),
            },
        ];
        let node = Arc::new(FakeNode::default().with_channel_events(events.clone()));
        let client = LocalNodeClient::new(node.clone());

        let mut rx = client.subscribe_channel_events().await.unwrap();
        let mut received = Vec::new();
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(received, events);
    }

    #[tokio::test]
    async fn invoice_subscription_follows_node_availability() {
        let node = Arc::new(FakeNode::default());
        let client = LocalNodeClient::new(node.clone());

        let mut rx = client.subscribe_invoices().await.unwrap();
        assert!(rx.recv().await.is_none());

        node.set_offline(true);
        assert!(client.subscribe_invoices().await.unwrap_err().is_transport());
        assert_eq!(client.consecutive_failures().await, 1);
    }
}
