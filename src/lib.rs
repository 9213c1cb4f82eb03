//! # rfs
//!
//! A minimal distributed file store:
//! - One master holding all metadata in a transactional RocksDB store
//! - Storage nodes discovered and health-checked by polling
//! - Files split into content-addressed chunks, replicated round-robin
//! - Deferred garbage collection of deleted files
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   client ──────►│            Master            │
//!   0xB0/B1/B2    │  metadata (RocksDB txns)     │
//!                 │  prober · placement · GC     │
//!                 └──────────────┬───────────────┘
//!                                │ 0xA0 probe, 0xB1 delete
//!        ┌───────────────────────┼───────────────────────┐
//!   ┌────▼─────┐            ┌────▼─────┐            ┌────▼─────┐
//!   │ Node 1   │            │ Node 2   │            │ Node 3   │
//!   │ chunks   │            │ chunks   │            │ chunks   │
//!   └──────────┘            └──────────┘            └──────────┘
//!        ▲ client stores and fetches chunks directly (0xB0 / 0xB2)
//! ```
//!
//! ## Usage
//!
//! ### Start a storage node
//! ```bash
//! rfs-node serve --bind 0.0.0.0:5900 --data ./node-data
//! ```
//!
//! ### Start the master
//! ```bash
//! rfs-master serve --bind 0.0.0.0:5900 --db ./master-data \
//!   --nodes 10.0.0.2:5900,10.0.0.3:5900,10.0.0.4:5900
//! ```
//!
//! ### Use the CLI
//! ```bash
//! rfs --master 10.0.0.1:5900 upload ./report.pdf /docs/report.pdf
//! rfs --master 10.0.0.1:5900 download /docs/report.pdf ./copy.pdf
//! rfs --master 10.0.0.1:5900 delete /docs/report.pdf
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod coordinator;
pub mod volume;

// Re-export commonly used types
pub use client::Client;
pub use common::{Config, Error, Result};
pub use coordinator::Coordinator;
pub use volume::VolumeServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
