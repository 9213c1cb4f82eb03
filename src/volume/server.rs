//! Storage node server
//!
//! Answers the master's membership probe and serves store / retrieve /
//! delete-by-id for chunks. Like the master, each connection carries one
//! request.

use crate::common::protocol::{
    self, Status, CMD_DELETE_CHUNK, CMD_PROBE, CMD_RETRIEVE_CHUNK, CMD_STORE_CHUNK,
    UNASSIGNED_NODE_ID,
};
use crate::common::{with_timeout, ChunkId, Error, Result, VolumeConfig};
use crate::volume::blob::BlobStore;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::Instrument;

pub struct VolumeServer {
    config: VolumeConfig,
    listener: TcpListener,
    store: Arc<BlobStore>,
}

impl VolumeServer {
    pub async fn bind(config: VolumeConfig) -> Result<Self> {
        let store = Arc::new(BlobStore::open(&config.data_path)?);
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self {
            config,
            listener,
            store,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn store(&self) -> Arc<BlobStore> {
        self.store.clone()
    }

    /// Serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Starting storage node");
        tracing::info!("  Listen: {}", self.local_addr()?);
        tracing::info!("  Data path: {}", self.config.data_path.display());
        tracing::info!("  Node id: {}", self.store.node_id());
        tracing::info!("✓ Storage node ready");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = self.store.clone();
                        let idle = self.config.idle_timeout();
                        let max_frame_len = self.config.max_frame_len;
                        tokio::spawn(
                            async move {
                                if let Err(e) = handle_connection(stream, store, idle, max_frame_len).await {
                                    tracing::debug!("Request failed: {}", e);
                                }
                            }
                            .instrument(tracing::debug_span!("node_conn", %peer)),
                        );
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutting down storage node");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Serve one request from the master or a client
pub async fn handle_connection<S>(
    mut stream: S,
    store: Arc<BlobStore>,
    idle: Duration,
    max_frame_len: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = match with_timeout(idle, "node idle", async {
        stream.read_u8().await.map_err(Error::from)
    })
    .await
    {
        Ok(byte) => byte,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = match command {
        CMD_PROBE => answer_probe(&mut stream, &store, idle).await,
        CMD_STORE_CHUNK => {
            let (id, data) = with_timeout(idle, "node idle", async {
                let id = protocol::read_chunk_id(&mut stream).await?;
                let data = protocol::read_frame(&mut stream, max_frame_len).await?;
                Ok::<_, Error>((id, data))
            })
            .await?;
            let store = store.clone();
            blocking(move || store.put(&id, &data)).await?;
            tracing::debug!("Stored chunk {}", id);
            protocol::write_status(&mut stream, Status::Ok).await
        }
        CMD_DELETE_CHUNK => {
            let id = read_id(&mut stream, idle).await?;
            let store = store.clone();
            let existed = blocking(move || store.delete(&id)).await?;
            tracing::debug!("Deleted chunk {} (present: {})", id, existed);
            protocol::write_status(&mut stream, Status::Ok).await
        }
        CMD_RETRIEVE_CHUNK => {
            let id = read_id(&mut stream, idle).await?;
            let store = store.clone();
            match blocking(move || store.get(&id)).await? {
                Some(data) => {
                    protocol::write_status(&mut stream, Status::Ok).await?;
                    protocol::write_frame(&mut stream, &data).await
                }
                None => Err(Error::NotFound(id.to_hex())),
            }
        }
        other => Err(Error::UnknownCommand(other)),
    };

    if let Err(e) = &result {
        if !matches!(e, Error::Io(_)) {
            let _ = protocol::write_status(&mut stream, e.status()).await;
        }
    }
    let _ = stream.shutdown().await;
    result
}

async fn answer_probe<S>(stream: &mut S, store: &BlobStore, idle: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let current = store.node_id();
    stream.write_u8(current).await?;
    stream.flush().await?;
    if current != UNASSIGNED_NODE_ID {
        return Ok(());
    }

    let assigned = with_timeout(idle, "id assignment", async {
        stream.read_u8().await.map_err(Error::from)
    })
    .await?;
    store.set_node_id(assigned)?;
    tracing::info!("Master assigned node id {}", assigned);
    Ok(())
}

async fn read_id<S: AsyncRead + Unpin>(stream: &mut S, idle: Duration) -> Result<ChunkId> {
    with_timeout(idle, "node idle", protocol::read_chunk_id(stream)).await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}
