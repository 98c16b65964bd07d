//! Service layer between the wire adapters and the application context.

pub mod data_aggregator;
pub mod data_source;
pub mod enrichment;
pub mod health;
pub mod node_manager;
pub mod recommendations;
pub mod source_router;
