//! Undirected channel graph built from a directory snapshot, with the topology
//! measures used for network analysis: connected components, a bounded
//! diameter estimate, sampled betweenness centrality and capacity-weighted
//! shortest paths.
//!
//! Node indices follow the lexicographic order of pubkeys, so every measure
//! here is deterministic for a given snapshot.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::errors::AdapterError;
use crate::models::GraphSnapshot;

/// Nodes of the largest component, in BFS order, the diameter is computed over.
pub const DIAMETER_NODE_BOUND: usize = 1_000;
/// Pivot count for betweenness sampling.
pub const BETWEENNESS_SAMPLES: usize = 100;
pub const TOP_CENTRAL_NODES: usize = 20;
const BETWEENNESS_SEED: u64 = 0x6c6e_6772_6170_6800;
/// Path cost of an edge is `PATH_WEIGHT_SCALE / capacity`.
const PATH_WEIGHT_SCALE: f64 = 1e9;

#[derive(Debug, Clone, PartialEq)]
struct Edge {
    channel_id: String,
    capacity: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelGraph {
    pubkeys: Vec<String>,
    index: BTreeMap<String, usize>,
    adjacency: Vec<BTreeMap<usize, Edge>>,
    edge_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub from_node: String,
    pub to_node: String,
    pub channel_id: String,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralNode {
    pub pubkey: String,
    pub centrality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyReport {
    pub num_nodes: usize,
    pub num_channels: usize,
    pub avg_degree: f64,
    pub density: f64,
    pub component_count: usize,
    pub largest_component_size: usize,
    pub largest_component_ratio: f64,
    /// Hop-count diameter of the bounded largest-component subgraph; `None`
    /// when it is trivial or not connected.
    pub network_diameter: Option<usize>,
    pub top_betweenness_nodes: Vec<CentralNode>,
    pub analyzed_at: DateTime<Utc>,
}

impl ChannelGraph {
    /// Builds the graph from a snapshot. Announced nodes without channels are
    /// kept as isolated vertices; parallel channels collapse into one edge that
    /// keeps the largest capacity.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut keys: Vec<&str> = snapshot.nodes.keys().map(String::as_str).collect();
        for channel in snapshot.channels.values() {
            keys.push(&channel.node1_pub);
            keys.push(&channel.node2_pub);
        }
        keys.sort_unstable();
        keys.dedup();

        let pubkeys: Vec<String> = keys.into_iter().map(str::to_string).collect();
        let index: BTreeMap<String, usize> = pubkeys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();
        let mut graph = ChannelGraph {
            adjacency: vec![BTreeMap::new(); pubkeys.len()],
            pubkeys,
            index,
            edge_count: 0,
        };

        for channel in snapshot.channels.values() {
            let (Some(&a), Some(&b)) = (
                graph.index.get(&channel.node1_pub),
                graph.index.get(&channel.node2_pub),
            ) else {
                continue;
            };
            if a == b {
                continue;
            }
            let edge = Edge {
                channel_id: channel.channel_id.clone(),
                capacity: channel.capacity,
            };
            match graph.adjacency[a].get(&b) {
                None => graph.edge_count += 1,
                Some(existing) if existing.capacity >= edge.capacity => continue,
                Some(_) => {}
            }
            graph.adjacency[a].insert(b, edge.clone());
            graph.adjacency[b].insert(a, edge);
        }
        graph
    }

    pub fn node_count(&self) -> usize {
        self.pubkeys.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.index.contains_key(pubkey)
    }

    pub fn degree(&self, pubkey: &str) -> Option<usize> {
        self.index.get(pubkey).map(|&i| self.adjacency[i].len())
    }

    /// Capacity of the (collapsed) edge between two nodes.
    pub fn capacity_between(&self, a: &str, b: &str) -> Option<u64> {
        let (a, b) = (self.index.get(a)?, self.index.get(b)?);
        self.adjacency[*a].get(b).map(|e| e.capacity)
    }

    /// Connected components as index lists, largest first.
    fn components(&self) -> Vec<Vec<usize>> {
        let mut seen = vec![false; self.node_count()];
        let mut components = Vec::new();
        for start in 0..self.node_count() {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut component = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(v) = queue.pop_front() {
                for &w in self.adjacency[v].keys() {
                    if !seen[w] {
                        seen[w] = true;
                        component.push(w);
                        queue.push_back(w);
                    }
                }
            }
            component.sort_unstable();
            components.push(component);
        }
        components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));
        components
    }

    /// The first `limit` nodes reached by a BFS from `start`; connected by
    /// construction.
    fn reached_from(&self, start: usize, limit: usize) -> Vec<usize> {
        let mut seen = HashSet::from([start]);
        let mut order = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(v) = queue.pop_front() {
            for &w in self.adjacency[v].keys() {
                if order.len() >= limit {
                    return order;
                }
                if seen.insert(w) {
                    order.push(w);
                    queue.push_back(w);
                }
            }
        }
        order
    }

    /// Unweighted diameter of the subgraph induced by `members`.
    fn diameter_of(&self, members: &[usize]) -> Option<usize> {
        if members.len() < 2 {
            return None;
        }
        let allowed: HashSet<usize> = members.iter().copied().collect();
        let mut diameter = 0;
        for &source in members {
            let mut dist: BTreeMap<usize, usize> = BTreeMap::from([(source, 0)]);
            let mut queue = VecDeque::from([source]);
            while let Some(v) = queue.pop_front() {
                let next = dist[&v] + 1;
                for &w in self.adjacency[v].keys() {
                    if allowed.contains(&w) && !dist.contains_key(&w) {
                        dist.insert(w, next);
                        queue.push_back(w);
                    }
                }
            }
            if dist.len() != members.len() {
                return None;
            }
            diameter = diameter.max(dist.values().copied().max().unwrap_or(0));
        }
        Some(diameter)
    }

    /// Single-source dependency accumulation (Brandes) over unweighted paths.
    fn accumulate_from(&self, source: usize, scores: &mut [f64]) {
        let n = self.node_count();
        let mut order = Vec::with_capacity(n);
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0f64; n];
        let mut dist = vec![usize::MAX; n];
        sigma[source] = 1.0;
        dist[source] = 0;

        let mut queue = VecDeque::from([source]);
        while let Some(v) = queue.pop_front() {
            order.push(v);
            for &w in self.adjacency[v].keys() {
                if dist[w] == usize::MAX {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }

        let mut delta = vec![0f64; n];
        while let Some(w) = order.pop() {
            for &v in &preds[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != source {
                scores[w] += delta[w];
            }
        }
    }

    /// Normalised betweenness centrality estimated from `samples` pivots (exact
    /// when the graph has no more nodes than that), highest first.
    pub fn betweenness(&self, samples: usize, limit: usize) -> Vec<CentralNode> {
        let n = self.node_count();
        if n == 0 || samples == 0 {
            return Vec::new();
        }
        let mut scores = vec![0f64; n];
        let pivots: Vec<usize> = if samples >= n {
            (0..n).collect()
        } else {
            let mut rng = StdRng::seed_from_u64(BETWEENNESS_SEED);
            rand::seq::index::sample(&mut rng, n, samples).into_vec()
        };
        for &pivot in &pivots {
            self.accumulate_from(pivot, &mut scores);
        }

        let mut scale = if n > 2 {
            1.0 / ((n - 1) as f64 * (n - 2) as f64)
        } else {
            1.0
        };
        scale *= n as f64 / pivots.len() as f64;

        let mut ranked: Vec<CentralNode> = scores
            .into_iter()
            .enumerate()
            .map(|(i, score)| CentralNode {
                pubkey: self.pubkeys[i].clone(),
                centrality: score * scale,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.centrality
                .total_cmp(&a.centrality)
                .then_with(|| a.pubkey.cmp(&b.pubkey))
        });
        ranked.truncate(limit);
        ranked
    }

    pub fn analyze(&self) -> TopologyReport {
        let n = self.node_count();
        let m = self.edge_count();
        let components = self.components();
        let largest = components.first().map(Vec::as_slice).unwrap_or_default();
        let bounded = largest
            .first()
            .map(|&start| self.reached_from(start, DIAMETER_NODE_BOUND))
            .unwrap_or_default();

        TopologyReport {
            num_nodes: n,
            num_channels: m,
            avg_degree: if n > 0 { 2.0 * m as f64 / n as f64 } else { 0.0 },
            density: if n > 1 {
                2.0 * m as f64 / (n as f64 * (n - 1) as f64)
            } else {
                0.0
            },
            component_count: components.len(),
            largest_component_size: largest.len(),
            largest_component_ratio: if n > 0 {
                largest.len() as f64 / n as f64
            } else {
                0.0
            },
            network_diameter: self.diameter_of(&bounded),
            top_betweenness_nodes: self.betweenness(BETWEENNESS_SAMPLES, TOP_CENTRAL_NODES),
            analyzed_at: Utc::now(),
        }
    }

    /// Cheapest path where an edge costs `1e9 / capacity`, so wide channels are
    /// preferred. Empty when the target is unreachable.
    pub fn shortest_path(&self, source: &str, target: &str) -> Result<Vec<PathHop>, AdapterError> {
        let &from = self
            .index
            .get(source)
            .ok_or_else(|| AdapterError::NotFound(format!("node {} is not in the graph", source)))?;
        let &to = self
            .index
            .get(target)
            .ok_or_else(|| AdapterError::NotFound(format!("node {} is not in the graph", target)))?;
        if from == to {
            return Ok(Vec::new());
        }

        let n = self.node_count();
        let mut cost = vec![f64::INFINITY; n];
        let mut previous: Vec<Option<usize>> = vec![None; n];
        let mut heap = BinaryHeap::new();
        cost[from] = 0.0;
        heap.push(Frontier { cost: 0.0, node: from });

        while let Some(Frontier { cost: c, node: v }) = heap.pop() {
            if v == to {
                break;
            }
            if c > cost[v] {
                continue;
            }
            for (&w, edge) in &self.adjacency[v] {
                if edge.capacity == 0 {
                    continue;
                }
                let candidate = c + PATH_WEIGHT_SCALE / edge.capacity as f64;
                if candidate < cost[w] {
                    cost[w] = candidate;
                    previous[w] = Some(v);
                    heap.push(Frontier { cost: candidate, node: w });
                }
            }
        }

        if previous[to].is_none() {
            return Ok(Vec::new());
        }
        let mut hops = Vec::new();
        let mut current = to;
        while let Some(prev) = previous[current] {
            let edge = &self.adjacency[prev][&current];
            hops.push(PathHop {
                from_node: self.pubkeys[prev].clone(),
                to_node: self.pubkeys[current].clone(),
                channel_id: edge.channel_id.clone(),
                capacity: edge.capacity,
            });
            current = prev;
        }
        hops.reverse();
        Ok(hops)
    }
}

#[derive(Debug, PartialEq)]
struct Frontier {
    cost: f64,
    node: usize,
}

impl Eq for Frontier {}

impl Ord for Frontier {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelDescriptor, GraphPayload, NodeDescriptor};

    fn snapshot(nodes: &[&str], channels: &[(&str, &str, &str, u64)]) -> GraphSnapshot {
        GraphSnapshot::from_payload(
            GraphPayload {
                nodes: nodes
                    .iter()
                    .map(|k| NodeDescriptor {
                        pub_key: k.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                channels: channels
                    .iter()
                    .map(|(id, a, b, capacity)| ChannelDescriptor {
                        channel_id: id.to_string(),
                        node1_pub: a.to_string(),
                        node2_pub: b.to_string(),
                        capacity: *capacity,
                        last_update: 0,
                    })
                    .collect(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn parallel_channels_keep_largest_capacity() {
        let graph = ChannelGraph::from_snapshot(&snapshot(
            &["a", "b"],
            &[("1", "a", "b", 100), ("2", "b", "a", 900), ("3", "a", "b", 400)],
        ));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.capacity_between("a", "b"), Some(900));
        assert_eq!(graph.degree("a"), Some(1));
    }

    #[test]
    fn topology_of_a_path_with_an_isolated_node() {
        // a - b - c - d, plus e alone
        let graph = ChannelGraph::from_snapshot(&snapshot(
            &["a", "b", "c", "d", "e"],
            &[("1", "a", "b", 10), ("2", "b", "c", 10), ("3", "c", "d", 10)],
        ));
        let report = graph.analyze();
        assert_eq!(report.num_nodes, 5);
        assert_eq!(report.num_channels, 3);
        assert_eq!(report.component_count, 2);
        assert_eq!(report.largest_component_size, 4);
        assert!((report.largest_component_ratio - 0.8).abs() < 1e-9);
        assert!((report.avg_degree - 1.2).abs() < 1e-9);
        assert!((report.density - 0.3).abs() < 1e-9);
        assert_eq!(report.network_diameter, Some(3));
    }

    #[test]
    fn star_center_dominates_betweenness() {
        let graph = ChannelGraph::from_snapshot(&snapshot(
            &["hub", "x", "y", "z"],
            &[("1", "hub", "x", 1), ("2", "hub", "y", 1), ("3", "hub", "z", 1)],
        ));
        let ranked = graph.betweenness(BETWEENNESS_SAMPLES, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].pubkey, "hub");
        // every one of the 3 leaf pairs routes through the hub: 6 ordered / (3*2)
        assert!((ranked[0].centrality - 1.0).abs() < 1e-9);
        assert_eq!(ranked[1].centrality, 0.0);
    }

    #[test]
    fn sampled_betweenness_is_reproducible() {
        let mut channels = Vec::new();
        let names: Vec<String> = (0..150).map(|i| format!("n{:03}", i)).collect();
        for i in 1..names.len() {
            channels.push((i.to_string(), names[i - 1].clone(), names[i].clone(), 1000u64));
        }
        let borrowed: Vec<(&str, &str, &str, u64)> = channels
            .iter()
            .map(|(id, a, b, c)| (id.as_str(), a.as_str(), b.as_str(), *c))
            .collect();
        let graph = ChannelGraph::from_snapshot(&snapshot(&[], &borrowed));
        let first = graph.betweenness(BETWEENNESS_SAMPLES, TOP_CENTRAL_NODES);
        let second = graph.betweenness(BETWEENNESS_SAMPLES, TOP_CENTRAL_NODES);
        assert_eq!(first, second);
        assert_eq!(first.len(), TOP_CENTRAL_NODES);
    }

    #[test]
    fn path_prefers_wide_channels() {
        // direct a-d is thin; a-b-d is two fat hops
        let graph = ChannelGraph::from_snapshot(&snapshot(
            &["a", "b", "d"],
            &[("thin", "a", "d", 1_000), ("ab", "a", "b", 10_000_000), ("bd", "b", "d", 10_000_000)],
        ));
        let path = graph.shortest_path("a", "d").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].from_node, "a");
        assert_eq!(path[0].channel_id, "ab");
        assert_eq!(path[1].to_node, "d");
        assert_eq!(path[1].capacity, 10_000_000);
    }

    #[test]
    fn unreachable_and_unknown_targets() {
        let graph = ChannelGraph::from_snapshot(&snapshot(
            &["a", "b", "c"],
            &[("1", "a", "b", 10), ("2", "b", "c", 0)],
        ));
        assert!(graph.shortest_path("a", "c").unwrap().is_empty());
        assert!(matches!(
            graph.shortest_path("a", "zzz"),
            Err(AdapterError::NotFound(_))
        ));
    }

    #[test]
    fn diameter_is_bounded_to_a_connected_region() {
        // hub sorts last, so no index prefix of the component contains it
        let leaves: Vec<String> = (0..DIAMETER_NODE_BOUND).map(|i| format!("a{:04}", i)).collect();
        let channels: Vec<(String, &str)> = leaves.iter().map(|leaf| (format!("c-{}", leaf), leaf.as_str())).collect();
        let borrowed: Vec<(&str, &str, &str, u64)> = channels
            .iter()
            .map(|(id, leaf)| (id.as_str(), "zz_hub", *leaf, 1_000))
            .collect();
        let report = ChannelGraph::from_snapshot(&snapshot(&[], &borrowed)).analyze();
        assert_eq!(report.largest_component_size, DIAMETER_NODE_BOUND + 1);
        assert_eq!(report.network_diameter, Some(2));
        assert_eq!(report.top_betweenness_nodes[0].pubkey, "zz_hub");
    }

    #[test]
    fn empty_graph_reports_zeroes() {
        let report = ChannelGraph::default().analyze();
        assert_eq!(report.num_nodes, 0);
        assert_eq!(report.largest_component_size, 0);
        assert_eq!(report.network_diameter, None);
        assert!(report.top_betweenness_nodes.is_empty());
    }
}
