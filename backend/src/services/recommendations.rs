//! Channel management findings derived from an enriched node.
//!
//! Pure functions of the node's merged data: stuck channels first (most stuck
//! first), then unprofitable ones that were not already flagged as stuck
//! (least profitable first), then at most one node-wide liquidity finding.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::services::enrichment::{EnrichedChannel, EnrichedNode};

pub const STUCK_THRESHOLD: u32 = 70;
pub const HIGH_SEVERITY_STUCK_INDEX: u32 = 85;
pub const LOW_LOCAL_RATIO: f64 = 0.3;
pub const HIGH_LOCAL_RATIO: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Suggestion {
    Rebalance,
    WaitForPayments,
    ConsiderClosing,
    AdjustFees,
    CloseChannel,
    AddInboundLiquidity,
    AddOutboundLiquidity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recommendation {
    StuckChannel {
        channel_id: String,
        peer_pubkey: String,
        peer_alias: Option<String>,
        severity: Severity,
        stuck_index: u32,
        local_ratio: f64,
        suggestion: Suggestion,
        details: String,
    },
    UnprofitableChannel {
        channel_id: String,
        peer_pubkey: String,
        peer_alias: Option<String>,
        severity: Severity,
        net_profit: i64,
        total_forwards: u64,
        suggestion: Suggestion,
        details: String,
    },
    NodeBalance {
        severity: Severity,
        local_ratio: f64,
        suggestion: Suggestion,
        details: String,
    },
}

impl Recommendation {
    pub fn severity(&self) -> Severity {
        match self {
            Recommendation::StuckChannel { severity, .. }
            | Recommendation::UnprofitableChannel { severity, .. }
            | Recommendation::NodeBalance { severity, .. } => *severity,
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Recommendation::StuckChannel { channel_id, .. }
            | Recommendation::UnprofitableChannel { channel_id, .. } => Some(channel_id),
            Recommendation::NodeBalance { .. } => None,
        }
    }
}

fn stuck(channel: &EnrichedChannel, index: u32) -> Recommendation {
    let ratio = channel.local_ratio();
    let suggestion = if ratio > HIGH_LOCAL_RATIO {
        Suggestion::Rebalance
    } else if ratio < LOW_LOCAL_RATIO {
        Suggestion::WaitForPayments
    } else {
        Suggestion::ConsiderClosing
    };
    Recommendation::StuckChannel {
        channel_id: channel.channel_id.clone(),
        peer_pubkey: channel.node2_pub.clone(),
        peer_alias: channel.peer_alias.clone(),
        severity: if index > HIGH_SEVERITY_STUCK_INDEX {
            Severity::High
        } else {
            Severity::Medium
        },
        stuck_index: index,
        local_ratio: ratio,
        suggestion,
        details: format!(
            "Channel likely stuck (index {}/100), {:.1}% of capacity on our side",
            index,
            ratio * 100.0
        ),
    }
}

fn unprofitable(channel: &EnrichedChannel) -> Recommendation {
    let forwards = channel.forwarding_stats.total_forwards;
    Recommendation::UnprofitableChannel {
        channel_id: channel.channel_id.clone(),
        peer_pubkey: channel.node2_pub.clone(),
        peer_alias: channel.peer_alias.clone(),
        severity: Severity::Medium,
        net_profit: channel.profitability.net_profit,
        total_forwards: forwards,
        suggestion: if forwards > 0 {
            Suggestion::AdjustFees
        } else {
            Suggestion::CloseChannel
        },
        details: format!(
            "Channel not profitable: net {} sat over {} forwards",
            channel.profitability.net_profit, forwards
        ),
    }
}

/// Low local share asks for more outbound liquidity (the suggestion is named for
/// what is missing); a node with no capacity gets no finding.
fn node_balance(node: &EnrichedNode) -> Option<Recommendation> {
    let ratio = node.local_ratio()?;
    let (suggestion, details) = if ratio < LOW_LOCAL_RATIO {
        (
            Suggestion::AddOutboundLiquidity,
            format!(
                "Only {:.1}% of total capacity is local; open channels or push liquidity out",
                ratio * 100.0
            ),
        )
    } else if ratio > HIGH_LOCAL_RATIO {
        (
            Suggestion::AddInboundLiquidity,
            format!(
                "{:.1}% of total capacity is local; acquire inbound liquidity",
                ratio * 100.0
            ),
        )
    } else {
        return None;
    };
    Some(Recommendation::NodeBalance {
        severity: Severity::Medium,
        local_ratio: ratio,
        suggestion,
        details,
    })
}

pub fn recommendations_at(node: &EnrichedNode, now: DateTime<Utc>) -> Vec<Recommendation> {
    let mut stuck_channels: Vec<(&EnrichedChannel, u32)> = node
        .channels
        .values()
        .map(|c| (c, c.stuck_index_at(now)))
        .filter(|(_, index)| *index >= STUCK_THRESHOLD)
        .collect();
    stuck_channels.sort_by(|a, b| b.1.cmp(&a.1));

    let mut losing: Vec<&EnrichedChannel> = node
        .unprofitable_channels()
        .into_iter()
        .filter(|c| !stuck_channels.iter().any(|(s, _)| s.channel_id == c.channel_id))
        .collect();
    losing.sort_by_key(|c| c.profitability.net_profit);

    let mut findings: Vec<Recommendation> = stuck_channels.iter().map(|(c, index)| stuck(c, *index)).collect();
    findings.extend(losing.into_iter().map(unprofitable));
    findings.extend(node_balance(node));
    findings
}

pub fn get_channel_recommendations(node: &EnrichedNode) -> Vec<Recommendation> {
    recommendations_at(node, Utc::now())
}
