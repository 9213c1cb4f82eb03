//! Client connection handler
//!
//! One handler per accepted connection. The first byte selects the
//! sub-protocol (upload, delete, retrieve); the handler runs it to completion
//! and the connection closes. Failures are reported with a single status byte
//! and never affect other connections.

use crate::common::protocol::{self, Command, RetrievalReply, Status};
use crate::common::{with_timeout, Error, MetricsRegistry, Result};
use crate::coordinator::gc::GarbageCollector;
use crate::coordinator::metadata::{DeleteOutcome, MetadataStore};
use crate::coordinator::placement::PlacementPolicy;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

/// Shared state every connection handler works against
pub struct HandlerContext {
    pub store: Arc<MetadataStore>,
    pub policy: PlacementPolicy,
    pub gc: Arc<GarbageCollector>,
    pub metrics: Arc<MetricsRegistry>,
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
}

pub struct ConnectionHandler<S> {
    stream: S,
    ctx: Arc<HandlerContext>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, ctx: Arc<HandlerContext>) -> Self {
        Self { stream, ctx }
    }

    /// Serve one request and close
    pub async fn run(mut self) -> Result<()> {
        let metrics = self.ctx.metrics.clone();
        metrics.connections_total.inc();
        metrics.active_connections.inc();

        let result = self.dispatch().await;

        metrics.active_connections.dec();
        let _ = self.stream.shutdown().await;
        result
    }

    async fn dispatch(&mut self) -> Result<()> {
        let byte = match idle(self.ctx.idle_timeout, async {
            self.stream.read_u8().await.map_err(Error::from)
        })
        .await
        {
            Ok(byte) => byte,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!("Connection closed before a command was sent");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let command = Command::from_byte(byte);
        let result = match command {
            Some(Command::Upload) => self.upload().await,
            Some(Command::Delete) => self.delete().await,
            Some(Command::Retrieve) => self.retrieve().await,
            None => Err(Error::UnknownCommand(byte)),
        };
        self.ctx
            .metrics
            .record_request(started.elapsed(), result.is_ok());

        if let Err(e) = &result {
            let op = command.map(|c| c.as_str()).unwrap_or("unknown");
            match e {
                Error::Io(_) => {
                    tracing::debug!("Client went away during {}: {}", op, e);
                    return result;
                }
                Error::RocksDb(_) | Error::MetadataCorrupted(_) | Error::Internal(_) => {
                    tracing::error!("{} failed: {}", op, e);
                }
                _ => tracing::warn!("{} rejected: {}", op, e),
            }
            let _ = protocol::write_status(&mut self.stream, e.status()).await;
        }
        result
    }

    async fn upload(&mut self) -> Result<()> {
        let store = self.ctx.store.clone();

        let advertised = store.online_nodes()?.len();
        self.stream
            .write_u8(u8::try_from(advertised).unwrap_or(u8::MAX))
            .await?;
        self.stream.flush().await?;
        if advertised == 0 {
            return Err(Error::NoNodesAvailable);
        }

        let max_frame_len = self.ctx.max_frame_len;
        let blob = idle(
            self.ctx.idle_timeout,
            protocol::read_frame(&mut self.stream, max_frame_len),
        )
        .await?;
        let chunk_ids = protocol::parse_chunk_ids(&blob)?;
        // Held until the commit, while the client writes chunks to the nodes
        let pins = store.pin_chunks(&chunk_ids)?;

        let online = store.online_nodes()?;
        if online.len() < advertised {
            return Err(Error::NodeSetChanged {
                advertised,
                current: online.len(),
            });
        }

        let plan = self.ctx.policy.place(&chunk_ids, &online)?;
        if plan.is_degraded() {
            self.ctx.metrics.degraded_uploads_total.inc();
            tracing::warn!(
                requested = plan.requested_replicas,
                achieved = plan.achieved_replicas,
                "Too few online nodes for full replication"
            );
        }
        protocol::write_status(&mut self.stream, Status::Ok).await?;
        protocol::write_frame(&mut self.stream, &plan.to_reply().encode()).await?;

        let path = idle(self.ctx.idle_timeout, protocol::read_path(&mut self.stream)).await?;
        let record = store.commit_upload(&path, &plan)?;
        drop(pins);
        protocol::write_status(&mut self.stream, Status::Ok).await?;

        self.ctx.metrics.uploads_total.inc();
        tracing::info!(
            "Stored {} ({} chunks x{} replicas)",
            record.path,
            record.chunk_order.len(),
            plan.achieved_replicas
        );
        Ok(())
    }

    async fn delete(&mut self) -> Result<()> {
        let path = idle(self.ctx.idle_timeout, protocol::read_path(&mut self.stream)).await?;

        match self.ctx.store.mark_deleted(&path)? {
            DeleteOutcome::NotFound => Err(Error::NotFound(path)),
            DeleteOutcome::AlreadyDeleted => {
                tracing::debug!("{} already deleted", path);
                protocol::write_status(&mut self.stream, Status::Ok).await
            }
            DeleteOutcome::Deleted { file, targets } => {
                self.ctx.metrics.deletes_total.inc();
                tracing::info!(
                    "Deleted {} ({} chunks, {} replica deletes dispatched)",
                    file.path,
                    file.chunk_order.len(),
                    targets.len()
                );

                // Dispatch owns the reclaim marks, so it starts even if the
                // client is gone
                if !targets.is_empty() {
                    let gc = self.ctx.gc.clone();
                    tokio::spawn(
                        async move {
                            let total = targets.len();
                            let done = gc.dispatch_deletes(targets, Some(&file.path)).await;
                            if done < total {
                                tracing::debug!(
                                    "{} of {} replica deletes left for GC",
                                    total - done,
                                    total
                                );
                            }
                        }
                        .instrument(tracing::Span::current()),
                    );
                }
                protocol::write_status(&mut self.stream, Status::Ok).await
            }
        }
    }

    async fn retrieve(&mut self) -> Result<()> {
        let path = idle(self.ctx.idle_timeout, protocol::read_path(&mut self.stream)).await?;

        let resolved = self.ctx.store.resolve_retrieval(&path)?;
        let reply = RetrievalReply {
            chunks: resolved
                .into_iter()
                .map(|(chunk_id, node)| (chunk_id, node.address))
                .collect(),
        };

        protocol::write_status(&mut self.stream, Status::Ok).await?;
        protocol::write_frame(&mut self.stream, &reply.encode()).await?;

        self.ctx.metrics.retrievals_total.inc();
        tracing::debug!("Resolved {} ({} chunks)", path, reply.chunks.len());
        Ok(())
    }
}

/// Bound a wait for client data by the idle timeout
async fn idle<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(limit, "client idle", fut).await
}
