//! Master (coordinator) implementation
//!
//! The master is responsible for:
//! - Metadata management (files → chunks → node placements)
//! - Node membership and liveness tracking by polling
//! - Placement decisions for uploads
//! - Garbage collection of deleted files
//! - Admin HTTP API and metrics

pub mod gc;
pub mod handler;
pub mod http;
pub mod membership;
pub mod metadata;
pub mod node_client;
pub mod placement;
pub mod registry;
pub mod server;

pub use metadata::{MetadataStore, NodeRecord};
pub use node_client::StorageNodeClient;
pub use server::Coordinator;
