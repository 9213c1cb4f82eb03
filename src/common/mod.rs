//! Common utilities and types shared across rfs

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod protocol;
pub mod utils;

pub use config::{Config, CoordinatorConfig, DiscoveryConfig, VolumeConfig};
pub use error::{Error, Result};
pub use hash::{blob_prefix, ChunkId, CHUNK_ID_LEN};
pub use metrics::MetricsRegistry;
pub use protocol::{Command, Status};
pub use utils::{format_bytes, timestamp_now, with_timeout};
