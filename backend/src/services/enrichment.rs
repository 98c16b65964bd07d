//! Cross-source views of a node and its channels.
//!
//! An `EnrichedNode` holds what each source said about a node (raw payload per
//! source, `None` when that source failed or knew nothing) merged into one
//! set of fields. Channel health measures (`local_ratio`, `stuck_index`,
//! profitability) are computed from the merged data on read.

use std::collections::BTreeMap;

use adapters::utils::{value_id, value_str, value_u64};
use adapters::{Channel, ForwardingEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Forward count at which a channel no longer counts as low-volume.
const VOLUME_SATURATION: f64 = 10.0;
/// Days without a forward after which the idle factor is maxed out.
const IDLE_SATURATION_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForwardingStats {
    pub total_forwards: u64,
    pub total_amount_forwards: u64,
    pub total_fees: u64,
    pub last_forward_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebalancingStats {
    pub total_rebalances: u64,
    pub total_amount_rebalanced: u64,
    pub total_fees_paid: u64,
    pub last_rebalance_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Profitability {
    pub revenue: u64,
    pub costs: u64,
    pub net_profit: i64,
    pub roi: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichedChannel {
    pub channel_id: String,
    /// The node the channel was enriched for.
    pub node1_pub: String,
    /// The peer.
    pub node2_pub: String,
    pub peer_alias: Option<String>,
    pub capacity: u64,
    pub local_balance: u64,
    pub remote_balance: u64,
    pub unsettled_balance: u64,
    pub active: bool,
    pub private: bool,
    pub initiator: bool,
    pub local_data: Option<Value>,
    pub directory_data: Option<Value>,
    pub aggregator_data: Option<Value>,
    pub forwarding_stats: ForwardingStats,
    pub rebalancing_stats: RebalancingStats,
    pub profitability: Profitability,
}

impl EnrichedChannel {
    pub fn from_local(own_pubkey: &str, channel: &Channel) -> Self {
        Self {
            channel_id: channel.channel_id.clone(),
            node1_pub: own_pubkey.to_string(),
            node2_pub: channel.remote_pubkey.clone(),
            capacity: channel.capacity,
            local_balance: channel.local_balance,
            remote_balance: channel.remote_balance,
            unsettled_balance: channel.unsettled_balance,
            active: channel.active,
            private: channel.private,
            initiator: channel.initiator,
            local_data: serde_json::to_value(channel).ok(),
            ..Default::default()
        }
    }

    /// Share of the capacity on our side, in `[0, 1]`; zero without capacity.
    pub fn local_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.local_balance as f64 / self.capacity as f64).clamp(0.0, 1.0)
    }

    /// Whole days since the last forward, `None` if it never forwarded.
    pub fn days_since_last_forward(&self, now: DateTime<Utc>) -> Option<i64> {
        self.forwarding_stats
            .last_forward_time
            .map(|last| (now - last).num_days().max(0))
    }

    /// Likelihood (0 to 100) that the channel is stuck, from imbalance,
    /// idle time and forwarding volume.
    pub fn stuck_index_at(&self, now: DateTime<Utc>) -> u32 {
        let balance_factor = (self.local_ratio() - 0.5).abs() * 2.0;
        let time_factor = match self.days_since_last_forward(now) {
            Some(days) => (days as f64 / IDLE_SATURATION_DAYS).min(1.0),
            None => 1.0,
        };
        let volume_factor = (1.0 - self.forwarding_stats.total_forwards as f64 / VOLUME_SATURATION).max(0.0);
        let index = 0.3 * balance_factor + 0.5 * time_factor + 0.2 * volume_factor;
        (index * 100.0).round() as u32
    }

    pub fn stuck_index(&self) -> u32 {
        self.stuck_index_at(Utc::now())
    }

    pub fn is_profitable(&self) -> bool {
        self.profitability.net_profit > 0
    }

    /// Folds a per-source channel payload in; only fills capacity when unknown.
    fn enrich_from(&mut self, payload: &Value) {
        if self.capacity == 0 {
            if let Some(capacity) = value_u64(payload, "capacity") {
                self.capacity = capacity;
            }
        }
    }

    fn settle_profitability(&mut self) {
        let p = &mut self.profitability;
        p.costs = self.rebalancing_stats.total_fees_paid;
        if self.forwarding_stats.total_forwards == 0 {
            // never routed: opportunity cost only
            p.net_profit = -1;
            p.roi = 0.0;
            return;
        }
        p.net_profit = p.revenue as i64 - p.costs as i64;
        p.roi = if self.capacity > 0 {
            p.net_profit as f64 / self.capacity as f64
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub num_channels: usize,
    pub active_channels: usize,
    pub total_capacity: u64,
    pub total_local_balance: u64,
    pub total_remote_balance: u64,
    pub local_ratio: f64,
    pub total_forwards: u64,
    pub total_fees: u64,
    pub net_profit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedNode {
    pub pubkey: String,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub channels: BTreeMap<String, EnrichedChannel>,
    pub local_data: Option<Value>,
    pub directory_data: Option<Value>,
    pub aggregator_data: Option<Value>,
    pub performance_metrics: PerformanceMetrics,
    pub last_update: DateTime<Utc>,
}

impl EnrichedNode {
    pub fn new(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            alias: None,
            color: None,
            channels: BTreeMap::new(),
            local_data: None,
            directory_data: None,
            aggregator_data: None,
            performance_metrics: PerformanceMetrics::default(),
            last_update: Utc::now(),
        }
    }

    /// Whether any source contributed anything.
    pub fn is_known(&self) -> bool {
        self.local_data.is_some()
            || self.directory_data.is_some()
            || self.aggregator_data.is_some()
            || !self.channels.is_empty()
    }

    pub fn total_capacity(&self) -> u64 {
        self.channels.values().map(|c| c.capacity).sum()
    }

    pub fn total_local_balance(&self) -> u64 {
        self.channels.values().map(|c| c.local_balance).sum()
    }

    pub fn total_remote_balance(&self) -> u64 {
        self.channels.values().map(|c| c.remote_balance).sum()
    }

    /// Aggregate local share across all channels; `None` without capacity.
    pub fn local_ratio(&self) -> Option<f64> {
        let capacity = self.total_capacity();
        (capacity > 0).then(|| self.total_local_balance() as f64 / capacity as f64)
    }

    pub fn stuck_channels_at(&self, now: DateTime<Utc>, threshold: u32) -> Vec<&EnrichedChannel> {
        self.channels
            .values()
            .filter(|c| c.stuck_index_at(now) >= threshold)
            .collect()
    }

    pub fn unprofitable_channels(&self) -> Vec<&EnrichedChannel> {
        self.channels.values().filter(|c| !c.is_profitable()).collect()
    }

    /// Local node data: identity plus its own channels, with forwarding
    /// history folded into per-channel stats.
    pub fn apply_local(&mut self, info: Value, channels: &[Channel], forwards: &[ForwardingEvent]) {
        for channel in channels {
            self.channels
                .insert(channel.channel_id.clone(), EnrichedChannel::from_local(&self.pubkey, channel));
        }
        for event in forwards {
            if let Some(incoming) = self.channels.get_mut(&event.chan_id_in) {
                let stats = &mut incoming.forwarding_stats;
                stats.total_forwards += 1;
                stats.total_amount_forwards += event.amt_in;
                stats.total_fees += event.fee;
                stats.last_forward_time = stats.last_forward_time.max(Some(event.timestamp));
                incoming.profitability.revenue += event.fee;
            }
            if let Some(outgoing) = self.channels.get_mut(&event.chan_id_out) {
                let stats = &mut outgoing.forwarding_stats;
                stats.total_forwards += 1;
                stats.total_amount_forwards += event.amt_out;
                stats.last_forward_time = stats.last_forward_time.max(Some(event.timestamp));
            }
        }
        self.local_data = Some(info);
    }

    /// Node payload from the directory or the aggregator, with an optional
    /// channel listing. Channels we do not already know are ignored.
    pub fn apply_remote(&mut self, source: RemoteSource, node: Value, channels: Option<&Value>) {
        let listed = channels
            .cloned()
            .or_else(|| node.get("channels").cloned())
            .unwrap_or(Value::Null);
        if let Value::Array(listed) = &listed {
            for payload in listed {
                let Some(id) = value_id(payload, "channel_id")
                    .or_else(|| value_id(payload, "short_channel_id"))
                    .or_else(|| value_id(payload, "chan_id"))
                else {
                    continue;
                };
                if let Some(channel) = self.channels.get_mut(&id) {
                    channel.enrich_from(payload);
                    match source {
                        RemoteSource::Directory => channel.directory_data = Some(payload.clone()),
                        RemoteSource::Aggregator => channel.aggregator_data = Some(payload.clone()),
                    }
                }
            }
        }
        match source {
            RemoteSource::Directory => self.directory_data = Some(node),
            RemoteSource::Aggregator => self.aggregator_data = Some(node),
        }
    }

    /// Picks alias and color by precedence: local, then directory, then aggregator.
    pub fn resolve_identity(&mut self) {
        let sources = [&self.local_data, &self.directory_data, &self.aggregator_data];
        let pick = |key: &str| {
            sources
                .iter()
                .filter_map(|s| s.as_ref())
                .find_map(|v| value_str(v, key).filter(|s| !s.is_empty()))
        };
        let alias = pick("alias");
        let color = pick("color");
        self.alias = alias.or(self.alias.take());
        self.color = color.or(self.color.take());
    }

    /// Recomputes profitability and node-wide totals from the channels.
    pub fn recompute(&mut self) {
        for channel in self.channels.values_mut() {
            channel.settle_profitability();
        }
        let channels = self.channels.values();
        self.performance_metrics = PerformanceMetrics {
            num_channels: self.channels.len(),
            active_channels: self.channels.values().filter(|c| c.active).count(),
            total_capacity: self.total_capacity(),
            total_local_balance: self.total_local_balance(),
            total_remote_balance: self.total_remote_balance(),
            local_ratio: self.local_ratio().unwrap_or(0.0),
            total_forwards: channels.clone().map(|c| c.forwarding_stats.total_forwards).sum(),
            total_fees: channels.clone().map(|c| c.forwarding_stats.total_fees).sum(),
            net_profit: channels.map(|c| c.profitability.net_profit).sum(),
        };
        self.last_update = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSource {
    Directory,
    Aggregator,
}
