//! Storage node binary

use anyhow::Result;
use clap::{Parser, Subcommand};
use rfs::common::Config;
use rfs::volume::VolumeServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rfs-node")]
#[command(about = "rfs storage node: content-addressed chunk server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the storage node
    Serve {
        /// Address to listen on (the master probes port 5900 by default)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Data directory for chunks and the assigned id
        #[arg(long)]
        data: Option<PathBuf>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, load_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::fallback(), Some(e)),
    };

    let Commands::Serve {
        bind,
        data,
        log_level,
    } = cli.command;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.unwrap_or(config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(e) = load_error {
        tracing::warn!("Using default configuration: {}", e);
    }

    let mut volume_config = config.volume.unwrap_or_default();
    if let Some(bind) = bind {
        volume_config.bind_addr = bind;
    }
    if let Some(data) = data {
        volume_config.data_path = data;
    }

    let server = VolumeServer::bind(volume_config).await?;
    server.serve().await?;

    Ok(())
}
