//! Master binary

use clap::{Parser, Subcommand};
use rfs::common::{Config, DiscoveryConfig};
use rfs::Coordinator;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rfs-master")]
#[command(about = "rfs master: metadata, membership and placement")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master
    Serve {
        /// Bind address for the client protocol
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bind address for the admin HTTP API
        #[arg(long)]
        admin: Option<SocketAddr>,

        /// Disable the admin HTTP API
        #[arg(long)]
        no_admin: bool,

        /// Metadata directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Target replication factor
        #[arg(long)]
        replicas: Option<usize>,

        /// Probe and GC interval in milliseconds
        #[arg(long)]
        refresh_ms: Option<u64>,

        /// Per-operation timeout towards nodes in milliseconds
        #[arg(long)]
        node_timeout_ms: Option<u64>,

        /// Static node list (comma-separated); subnet scan when omitted
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<SocketAddr>,

        /// Local address whose /24 is scanned
        #[arg(long, conflicts_with = "nodes")]
        local_ip: Option<Ipv4Addr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File config first so its log level can seed the filter
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::fallback(), Some(e)),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(e) = load_error {
        tracing::warn!("Using default configuration: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            admin,
            no_admin,
            db,
            replicas,
            refresh_ms,
            node_timeout_ms,
            nodes,
            local_ip,
        } => {
            // CLI flags take priority over the file
            let mut coord_config = config.coordinator.unwrap_or_default();
            if let Some(bind) = bind {
                coord_config.bind_addr = bind;
            }
            if let Some(admin) = admin {
                coord_config.admin_addr = Some(admin);
            }
            if no_admin {
                coord_config.admin_addr = None;
            }
            if let Some(db) = db {
                coord_config.db_path = db;
            }
            if let Some(replicas) = replicas {
                coord_config.replicas = replicas;
            }
            if let Some(ms) = refresh_ms {
                coord_config.refresh_interval_ms = ms;
            }
            if let Some(ms) = node_timeout_ms {
                coord_config.node_timeout_ms = ms;
            }
            if !nodes.is_empty() {
                coord_config.discovery = DiscoveryConfig::Static { nodes };
            } else if let Some(ip) = local_ip {
                let port = match coord_config.discovery {
                    DiscoveryConfig::Subnet { port, .. } => port,
                    DiscoveryConfig::Static { .. } => rfs::common::protocol::DEFAULT_PORT,
                };
                coord_config.discovery = DiscoveryConfig::Subnet {
                    local_ip: Some(ip),
                    port,
                };
            }

            let coord = Coordinator::bind(coord_config).await?;
            coord.serve().await?;
        }
    }

    Ok(())
}
