//! Health-aware multi-source data layer for monitoring a Lightning node.
//!
//! The local node, a public channel-graph directory and an optional network
//! aggregator are probed continuously; reads are routed to whichever backend
//! is healthy, and per-node views are merged across all of them.

pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod services;

#[cfg(test)]
mod test_support;

pub use context::AppContext;
