//! Configuration for rfs components
//!
//! Values come from an optional TOML file (`RFS_CONFIG`, default `rfs.toml`)
//! layered with `RFS_*` environment variables. Binaries override individual
//! fields from their command line.

use crate::common::protocol::{DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Master-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,

    /// Storage-node-specific config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `RFS_CONFIG` (default `rfs.toml`) and the
    /// environment; a missing file yields the defaults
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var("RFS_CONFIG").unwrap_or_else(|_| "rfs.toml".to_string());
        Self::load_from(&path).map_err(|e| match e {
            crate::Error::InvalidConfig(msg) => {
                crate::Error::InvalidConfig(format!("{}: {}", path, msg))
            }
            other => other,
        })
    }

    /// Defaults used when the configuration cannot be loaded
    pub fn fallback() -> Self {
        Self {
            log_level: default_log_level(),
            ..Default::default()
        }
    }

    pub fn load_from(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("RFS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }
}

/// How the master discovers candidate node addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode")]
pub enum DiscoveryConfig {
    /// Probe a fixed list of node addresses
    Static { nodes: Vec<SocketAddr> },
    /// Probe every host of the master's /24 subnet on the node port
    Subnet {
        #[serde(default)]
        local_ip: Option<std::net::Ipv4Addr>,
        #[serde(default = "default_port")]
        port: u16,
    },
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::Subnet {
            local_ip: None,
            port: DEFAULT_PORT,
        }
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bind address for the client-facing protocol
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Bind address for the admin HTTP API (disabled when absent)
    #[serde(default = "default_admin_addr")]
    pub admin_addr: Option<SocketAddr>,

    /// RocksDB path for metadata
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Target replication factor
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Membership probe and garbage collection cadence
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Timeout for every socket operation towards a node
    #[serde(default = "default_node_timeout")]
    pub node_timeout_ms: u64,

    /// Bound on idle waits for client data
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Largest accepted frame
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Row lock wait inside metadata transactions
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}
fn default_admin_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0, 0, 0, 0], 5980)))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./master-data")
}
fn default_replicas() -> usize {
    3
}
fn default_refresh_interval() -> u64 {
    5_000
}
fn default_node_timeout() -> u64 {
    500
}
fn default_idle_timeout() -> u64 {
    30_000
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_lock_timeout() -> u64 {
    500
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_addr: default_admin_addr(),
            db_path: default_db_path(),
            replicas: default_replicas(),
            refresh_interval_ms: default_refresh_interval(),
            node_timeout_ms: default_node_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            max_frame_len: default_max_frame_len(),
            lock_timeout_ms: default_lock_timeout(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.replicas == 0 {
            return Err(crate::Error::InvalidConfig(
                "replicas must be at least 1".into(),
            ));
        }
        if self.refresh_interval_ms == 0 || self.node_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "refresh interval and node timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Storage node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Directory holding chunk files and the assigned node id
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./node-data")
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_path: default_data_path(),
            max_frame_len: default_max_frame_len(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl VolumeConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.bind_addr.port(), 5900);
        assert_eq!(config.replicas, 3);
        assert_eq!(config.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.node_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_replicas() {
        let config = CoordinatorConfig {
            replicas: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rfs.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[coordinator]
replicas = 2
refresh_interval_ms = 1000

[coordinator.discovery]
mode = "static"
nodes = ["10.0.0.5:5900", "10.0.0.6:5900"]
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.log_level, "debug");
        let coord = config.coordinator.unwrap();
        assert_eq!(coord.replicas, 2);
        assert_eq!(coord.node_timeout_ms, 500);
        match coord.discovery {
            DiscoveryConfig::Static { nodes } => assert_eq!(nodes.len(), 2),
            other => panic!("unexpected discovery {:?}", other),
        }
    }

    #[test]
    fn test_load_reports_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[coordinator\nreplicas = ").unwrap();

        std::env::set_var("RFS_CONFIG", path.with_extension(""));
        let result = Config::load();
        std::env::remove_var("RFS_CONFIG");

        match result {
            Err(crate::Error::InvalidConfig(msg)) => assert!(msg.contains("broken")),
            other => panic!("expected a config error, got {:?}", other.map(|c| c.log_level)),
        }
        assert_eq!(Config::fallback().log_level, "info");
    }
}
