//! CLI for file operations

use clap::{Parser, Subcommand};
use rfs::common::format_bytes;
use rfs::Client;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rfs")]
#[command(about = "rfs distributed file store CLI")]
#[command(version)]
struct Cli {
    /// Master address
    #[arg(long, default_value = "127.0.0.1:5900")]
    master: SocketAddr,

    /// Replication factor assumed when sizing chunks
    #[arg(long, default_value = "3")]
    replicas: usize,

    /// Per-operation timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Upload {
        /// Local file
        file: PathBuf,

        /// Path in the store
        path: String,
    },

    /// Download a file
    Download {
        /// Path in the store
        path: String,

        /// Output file
        output: PathBuf,
    },

    /// Delete a file
    Delete {
        /// Path in the store
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client::new(cli.master)
        .with_replicas(cli.replicas)
        .with_timeout(Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::Upload { file, path } => {
            let data = tokio::fs::read(&file).await?;
            let report = client.upload(&path, &data).await?;
            println!("Uploaded {} -> {}", file.display(), path);
            println!("  Size: {}", format_bytes(report.bytes as u64));
            println!("  Chunks: {}", report.chunks);
            println!(
                "  Replicas: {} of {}",
                report.achieved_replicas, report.requested_replicas
            );
        }

        Commands::Download { path, output } => {
            let data = client.download(&path).await?;
            tokio::fs::write(&output, &data).await?;
            println!(
                "Downloaded {} -> {} ({})",
                path,
                output.display(),
                format_bytes(data.len() as u64)
            );
        }

        Commands::Delete { path } => {
            client.delete(&path).await?;
            println!("Deleted {}", path);
        }
    }

    Ok(())
}
