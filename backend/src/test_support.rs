//! In-memory stand-ins for the local node and the REST services.
//!
//! Shared by the unit tests (as `crate::test_support`) and by the integration
//! tests, which include this file by path. It therefore depends only on the
//! `adapters` crate and never on `crate::`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use adapters::{
    AdapterError, Channel, ChannelEvent, ChannelFilter, ChannelPoint, ForwardingEvent, ForwardingHistory,
    ForwardingQuery, InvoiceEvent, NodeAdapter, NodeInfo, OpenChannelRequest, PolicyUpdate, RebalanceOutcome,
    RebalanceRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub use adapters::rest::fake::FakeTransport;

/// Generator point of secp256k1; a valid compressed key used as the local node id.
pub const LOCAL_PUBKEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
pub const PEER_A: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";
pub const PEER_B: &str = "02f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f9";

pub fn channel(id: &str, remote: &str, capacity: u64, local: u64) -> Channel {
    Channel {
        channel_id: id.to_string(),
        channel_point: format!("{}:0", "ab".repeat(32)),
        remote_pubkey: remote.to_string(),
        capacity,
        local_balance: local,
        remote_balance: capacity.saturating_sub(local),
        active: true,
        ..Default::default()
    }
}

pub fn forward(chan_in: &str, chan_out: &str, amt: u64, fee: u64, at: DateTime<Utc>) -> ForwardingEvent {
    ForwardingEvent {
        timestamp: at,
        chan_id_in: chan_in.to_string(),
        chan_id_out: chan_out.to_string(),
        amt_in: amt + fee,
        amt_out: amt,
        fee,
        fee_msat: fee * 1000,
        amt_in_msat: (amt + fee) * 1000,
        amt_out_msat: amt * 1000,
    }
}

pub struct FakeNode {
    info: Mutex<NodeInfo>,
    channels: Mutex<Vec<Channel>>,
    forwards: Mutex<Vec<ForwardingEvent>>,
    channel_events: Mutex<Vec<ChannelEvent>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    last_close_target: Mutex<Option<u32>>,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self {
            info: Mutex::new(NodeInfo {
                pubkey: LOCAL_PUBKEY.to_string(),
                alias: "local-node".to_string(),
                color: "#3399ff".to_string(),
                block_height: 850_000,
                synced_to_chain: true,
                ..Default::default()
            }),
            channels: Mutex::new(Vec::new()),
            forwards: Mutex::new(Vec::new()),
            channel_events: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            last_close_target: Mutex::new(None),
        }
    }
}

impl FakeNode {
    pub fn with_channels(self, channels: Vec<Channel>) -> Self {
        *self.channels.lock().unwrap() = channels;
        self
    }

    pub fn with_forwards(self, forwards: Vec<ForwardingEvent>) -> Self {
        *self.forwards.lock().unwrap() = forwards;
        self
    }

    pub fn with_channel_events(self, events: Vec<ChannelEvent>) -> Self {
        *self.channel_events.lock().unwrap() = events;
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_close_target(&self) -> Option<u32> {
        *self.last_close_target.lock().unwrap()
    }

    fn enter(&self) -> Result<(), AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(AdapterError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeAdapter for FakeNode {
    fn endpoint(&self) -> String {
        "https://fake-node:8080".to_string()
    }

    async fn get_info(&self) -> Result<NodeInfo, AdapterError> {
        self.enter()?;
        Ok(self.info.lock().unwrap().clone())
    }

    async fn list_channels(&self, filter: ChannelFilter) -> Result<Vec<Channel>, AdapterError> {
        self.enter()?;
        Ok(self
            .channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| filter.admits(c))
            .cloned()
            .collect())
    }

    async fn forwarding_history(&self, query: &ForwardingQuery) -> Result<ForwardingHistory, AdapterError> {
        self.enter()?;
        let events: Vec<ForwardingEvent> = self
            .forwards
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.timestamp >= query.start_time && e.timestamp <= query.end_time)
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .cloned()
            .collect();
        let last_offset_index = query.offset + events.len() as u32;
        Ok(ForwardingHistory {
            events,
            last_offset_index,
        })
    }

    async fn open_channel(&self, _request: &OpenChannelRequest) -> Result<ChannelPoint, AdapterError> {
        self.enter()?;
        Ok(ChannelPoint {
            funding_txid: "cd".repeat(32),
            output_index: 1,
        })
    }

    async fn close_channel(
        &self,
        _channel_point: &ChannelPoint,
        _force: bool,
        target_conf: u32,
    ) -> Result<Option<String>, AdapterError> {
        self.enter()?;
        *self.last_close_target.lock().unwrap() = Some(target_conf);
        Ok(Some("closing-tx".to_string()))
    }

    async fn update_channel_policy(&self, _update: &PolicyUpdate) -> Result<(), AdapterError> {
        self.enter()
    }

    async fn rebalance(&self, request: &RebalanceRequest) -> Result<RebalanceOutcome, AdapterError> {
        self.enter()?;
        Ok(RebalanceOutcome {
            success: true,
            preimage: Some("00".repeat(32)),
            total_fees: 3,
            total_amt: request.amount_sat + 3,
            ..Default::default()
        })
    }

    async fn subscribe_channel_events(&self) -> Result<mpsc::Receiver<ChannelEvent>, AdapterError> {
        self.enter()?;
        let events = self.channel_events.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        Ok(rx)
    }

    async fn subscribe_invoices(&self) -> Result<mpsc::Receiver<InvoiceEvent>, AdapterError> {
        self.enter()?;
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}
