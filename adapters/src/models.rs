//! Generic data models for the `adapters` crate.
//!
//! These models define common, abstracted representations of Lightning Network
//! entities (node info, channels, forwarding events, graph descriptors) that any
//! adapter implementation produces, allowing the backend services to interact
//! with a consistent data format regardless of which wire protocol fed them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AdapterError;
use crate::utils;

/// Identity and sync state of the local node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub pubkey: String,
    pub alias: String,
    pub color: String,
    pub version: String,
    pub num_active_channels: u32,
    pub num_inactive_channels: u32,
    pub num_pending_channels: u32,
    pub block_height: u32,
    pub synced_to_chain: bool,
    pub synced_to_graph: bool,
    pub uris: Vec<String>,
    pub best_header_timestamp: Option<DateTime<Utc>>,
    pub chains: Vec<String>,
    pub features: BTreeMap<u32, NodeFeature>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFeature {
    pub name: String,
    pub is_required: bool,
    pub is_known: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Htlc {
    pub incoming: bool,
    pub amount: u64,
    pub expiration_height: u32,
    pub htlc_index: u64,
    /// Hex-encoded payment hash.
    pub hash_lock: String,
}

/// One of the local node's channels as reported by the node itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub channel_point: String,
    pub remote_pubkey: String,
    pub capacity: u64,
    pub local_balance: u64,
    pub remote_balance: u64,
    pub unsettled_balance: u64,
    pub active: bool,
    pub private: bool,
    pub initiator: bool,
    pub total_satoshis_sent: u64,
    pub total_satoshis_received: u64,
    pub num_updates: u64,
    pub commit_fee: u64,
    pub fee_per_kw: u64,
    pub local_chan_reserve_sat: u64,
    pub remote_chan_reserve_sat: u64,
    pub pending_htlcs: Vec<Htlc>,
}

/// Mutually exclusive activity filter for channel listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFilter {
    pub active_only: bool,
    pub inactive_only: bool,
}

impl ChannelFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            inactive_only: false,
        }
    }

    pub fn inactive() -> Self {
        Self {
            active_only: false,
            inactive_only: true,
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.active_only && self.inactive_only {
            return Err(AdapterError::Validation(
                "active_only and inactive_only are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn admits(&self, channel: &Channel) -> bool {
        !(self.active_only && !channel.active || self.inactive_only && channel.active)
    }
}

/// Time window and paging for forwarding history queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardingQuery {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub offset: u32,
    pub limit: u32,
}

impl ForwardingQuery {
    /// Events from the last `days` days, up to `limit` of them.
    pub fn last_days(days: i64, limit: u32) -> Self {
        let end_time = Utc::now();
        Self {
            start_time: end_time - Duration::days(days),
            end_time,
            offset: 0,
            limit,
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.start_time > self.end_time {
            return Err(AdapterError::Validation(format!(
                "forwarding window starts after it ends ({} > {})",
                self.start_time, self.end_time
            )));
        }
        Ok(())
    }
}

impl Default for ForwardingQuery {
    fn default() -> Self {
        Self::last_days(7, 100)
    }
}

/// A single payment routed through the local node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingEvent {
    pub timestamp: DateTime<Utc>,
    pub chan_id_in: String,
    pub chan_id_out: String,
    pub amt_in: u64,
    pub amt_out: u64,
    pub fee: u64,
    pub fee_msat: u64,
    pub amt_in_msat: u64,
    pub amt_out_msat: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardingHistory {
    pub events: Vec<ForwardingEvent>,
    pub last_offset_index: u32,
}

impl ForwardingHistory {
    pub fn total_count(&self) -> usize {
        self.events.len()
    }
}

/// Funding outpoint of a channel, written `txid:output_index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelPoint {
    pub funding_txid: String,
    pub output_index: u32,
}

impl FromStr for ChannelPoint {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s.split_once(':').ok_or_else(|| {
            AdapterError::Validation(format!("channel point {} is not txid:index", s))
        })?;
        if txid.len() != 64 || hex::decode(txid).is_err() {
            return Err(AdapterError::Validation(format!(
                "channel point {} has an invalid funding txid",
                s
            )));
        }
        let output_index = index.parse::<u32>().map_err(|err| {
            AdapterError::Validation(format!("channel point {} has a bad output index: {}", s, err))
        })?;
        Ok(Self {
            funding_txid: txid.to_string(),
            output_index,
        })
    }
}

impl fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.funding_txid, self.output_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub node_pubkey: String,
    pub local_funding_amount: u64,
    pub push_sat: u64,
    pub private: bool,
    pub min_htlc_msat: u64,
    pub remote_csv_delay: u32,
    pub spend_unconfirmed: bool,
}

impl OpenChannelRequest {
    pub fn new(node_pubkey: impl Into<String>, local_funding_amount: u64) -> Self {
        Self {
            node_pubkey: node_pubkey.into(),
            local_funding_amount,
            push_sat: 0,
            private: false,
            min_htlc_msat: 1000,
            remote_csv_delay: 144,
            spend_unconfirmed: false,
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        utils::parse_node_id(&self.node_pubkey)?;
        if self.local_funding_amount == 0 {
            return Err(AdapterError::Validation(
                "local funding amount must be positive".to_string(),
            ));
        }
        if self.push_sat >= self.local_funding_amount {
            return Err(AdapterError::Validation(
                "push amount must be below the funding amount".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fee-policy change for one channel; `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub channel_point: ChannelPoint,
    pub base_fee_msat: Option<u64>,
    pub fee_rate_ppm: Option<u32>,
    pub time_lock_delta: Option<u32>,
}

impl PolicyUpdate {
    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.base_fee_msat.is_none() && self.fee_rate_ppm.is_none() && self.time_lock_delta.is_none() {
            return Err(AdapterError::Validation(
                "policy update does not change anything".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circular payment moving liquidity out of `source_channels` and back in
/// through `target_channels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceRequest {
    pub source_channels: Vec<String>,
    pub target_channels: Vec<String>,
    pub amount_sat: u64,
    pub fee_limit_sat: u64,
}

impl RebalanceRequest {
    pub fn new(source_channels: Vec<String>, target_channels: Vec<String>, amount_sat: u64) -> Self {
        Self {
            source_channels,
            target_channels,
            amount_sat,
            fee_limit_sat: 100,
        }
    }

    pub fn validate(&self) -> Result<(), AdapterError> {
        if self.source_channels.is_empty() || self.target_channels.is_empty() {
            return Err(AdapterError::Validation(
                "rebalance needs at least one source and one target channel".to_string(),
            ));
        }
        if self.amount_sat == 0 {
            return Err(AdapterError::Validation(
                "rebalance amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteHop {
    pub chan_id: String,
    pub pub_key: String,
    pub amt_to_forward: u64,
    pub fee: u64,
    pub expiry: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceOutcome {
    pub success: bool,
    pub preimage: Option<String>,
    pub error: Option<String>,
    pub total_fees: u64,
    pub total_amt: u64,
    pub hops: Vec<RouteHop>,
}

/// Channel lifecycle notification from the node's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    Opened { channel_id: String, remote_pubkey: String, capacity: u64 },
    Closed { channel_id: String, remote_pubkey: String, capacity: u64, close_type: String },
    Active { channel_point: String },
    Inactive { channel_point: String },
    PendingOpen { txid: String, output_index: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceEvent {
    pub memo: String,
    /// Hex-encoded payment hash.
    pub r_hash: String,
    pub value: u64,
    pub settled: bool,
    pub state: String,
    pub amt_paid_sat: u64,
    pub creation_date: Option<DateTime<Utc>>,
    pub settle_date: Option<DateTime<Utc>>,
    pub payment_request: String,
}

/// A node as announced in the public graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(default, alias = "pubkey")]
    pub pub_key: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, deserialize_with = "utils::de_u64")]
    pub last_update: u64,
    #[serde(default)]
    pub addresses: Vec<serde_json::Value>,
}

/// A public channel edge between two announced nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    #[serde(
        default,
        alias = "chan_id",
        alias = "short_channel_id",
        deserialize_with = "utils::de_id"
    )]
    pub channel_id: String,
    #[serde(default)]
    pub node1_pub: String,
    #[serde(default)]
    pub node2_pub: String,
    #[serde(default, deserialize_with = "utils::de_u64")]
    pub capacity: u64,
    #[serde(default, deserialize_with = "utils::de_u64")]
    pub last_update: u64,
}

/// Wire shape of the directory's `/graph` response and of the durable copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphPayload {
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub channels: Vec<ChannelDescriptor>,
}

/// Immutable view of the public channel graph at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, NodeDescriptor>,
    pub channels: BTreeMap<String, ChannelDescriptor>,
    pub fetched_at: DateTime<Utc>,
}

impl GraphSnapshot {
    pub fn from_payload(payload: GraphPayload, fetched_at: DateTime<Utc>) -> Self {
        let nodes = payload
            .nodes
            .into_iter()
            .filter(|n| !n.pub_key.is_empty())
            .map(|n| (n.pub_key.clone(), n))
            .collect();
        let channels = payload
            .channels
            .into_iter()
            .filter(|c| !c.channel_id.is_empty() && !c.node1_pub.is_empty() && !c.node2_pub.is_empty())
            .map(|c| (c.channel_id.clone(), c))
            .collect();
        Self {
            nodes,
            channels,
            fetched_at,
        }
    }

    pub fn to_payload(&self) -> GraphPayload {
        GraphPayload {
            nodes: self.nodes.values().cloned().collect(),
            channels: self.channels.values().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.channels.is_empty()
    }

    /// Time elapsed since the snapshot was fetched; zero if the clock went backwards.
    pub fn age(&self) -> std::time::Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or_default()
    }

    pub fn node_channels<'a>(&'a self, pubkey: &'a str) -> impl Iterator<Item = &'a ChannelDescriptor> + 'a {
        self.channels
            .values()
            .filter(move |c| c.node1_pub == pubkey || c.node2_pub == pubkey)
    }

    pub fn total_capacity(&self) -> u64 {
        self.channels.values().map(|c| c.capacity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_filter_rejects_both_flags() {
        let both = ChannelFilter {
            active_only: true,
            inactive_only: true,
        };
        assert!(matches!(both.validate(), Err(AdapterError::Validation(_))));
        assert!(ChannelFilter::active().validate().is_ok());
        assert!(ChannelFilter::default().validate().is_ok());
    }

    #[test]
    fn channel_filter_admits_by_activity() {
        let active = Channel {
            active: true,
            ..Default::default()
        };
        let idle = Channel::default();
        assert!(ChannelFilter::active().admits(&active));
        assert!(!ChannelFilter::active().admits(&idle));
        assert!(ChannelFilter::inactive().admits(&idle));
        assert!(ChannelFilter::default().admits(&active));
    }

    #[test]
    fn channel_point_parses_and_prints() {
        let txid = "a".repeat(64);
        let point: ChannelPoint = format!("{}:1", txid).parse().unwrap();
        assert_eq!(point.output_index, 1);
        assert_eq!(point.to_string(), format!("{}:1", txid));
        assert!("abc".parse::<ChannelPoint>().is_err());
        assert!(format!("{}:x", txid).parse::<ChannelPoint>().is_err());
    }

    #[test]
    fn rebalance_requires_both_sides() {
        let missing_target = RebalanceRequest::new(vec!["1".into()], vec![], 10_000);
        assert!(missing_target.validate().is_err());
        let ok = RebalanceRequest::new(vec!["1".into()], vec!["2".into()], 10_000);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.fee_limit_sat, 100);
    }

    #[test]
    fn snapshot_drops_malformed_entries() {
        let payload: GraphPayload = serde_json::from_value(json!({
            "nodes": [{"pub_key": "a", "alias": "A"}, {"pub_key": ""}],
            "channels": [
                {"channel_id": 1, "node1_pub": "a", "node2_pub": "b", "capacity": "500"},
                {"channel_id": 2, "node1_pub": "a", "node2_pub": ""}
            ]
        }))
        .unwrap();
        let snapshot = GraphSnapshot::from_payload(payload, Utc::now());
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.channels["1"].capacity, 500);
        assert_eq!(snapshot.node_channels("a").count(), 1);
    }
}
