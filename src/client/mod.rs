//! Client library
//!
//! Upload splits a file into chunks sized from the online node count, stores
//! every replica on the nodes the master designates and only then names the
//! path, so a failed transfer never reaches the master's commit point.
//! Download resolves the chunk list and fetches each chunk from its node,
//! verifying it against its id.

use crate::common::protocol::{
    self, PlacementReply, RetrievalReply, Status, CMD_DELETE, CMD_RETRIEVE, CMD_UPLOAD,
};
use crate::common::{with_timeout, ChunkId, Error, Result};
use crate::coordinator::StorageNodeClient;
use futures_util::future::try_join_all;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a committed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub chunks: usize,
    pub bytes: usize,
    pub requested_replicas: u8,
    pub achieved_replicas: u8,
}

pub struct Client {
    master: SocketAddr,
    nodes: StorageNodeClient,
    replicas: usize,
    timeout: Duration,
}

impl Client {
    pub fn new(master: SocketAddr) -> Self {
        Self {
            master,
            nodes: StorageNodeClient::new(DEFAULT_CLIENT_TIMEOUT),
            replicas: 3,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    /// Replication factor assumed when sizing chunks
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.nodes = StorageNodeClient::new(timeout);
        self
    }

    async fn connect(&self, command: u8) -> Result<TcpStream> {
        let master = self.master;
        let mut stream = with_timeout(self.timeout, "connect to master", async {
            TcpStream::connect(master).await.map_err(Error::from)
        })
        .await?;
        stream.write_u8(command).await?;
        stream.flush().await?;
        Ok(stream)
    }

    pub async fn upload(&self, path: &str, data: &[u8]) -> Result<UploadReport> {
        protocol::validate_path(path)?;
        let mut master = self.connect(CMD_UPLOAD).await?;

        let online = master.read_u8().await? as usize;
        if online == 0 {
            protocol::expect_ok(&mut master).await.map_err(|e| typed(e, path))?;
            return Err(Error::NoNodesAvailable);
        }

        let pieces = split_chunks(data, (online / self.replicas).max(1));
        let ids: Vec<ChunkId> = pieces.iter().map(|p| ChunkId::of(p)).collect();
        protocol::write_frame(&mut master, &protocol::encode_chunk_ids(&ids)).await?;

        protocol::expect_ok(&mut master).await.map_err(|e| typed(e, path))?;
        let placement =
            PlacementReply::decode(protocol::read_frame(&mut master, 64 * 1024 * 1024).await?)?;
        if placement.targets.len() != ids.len() {
            return Err(Error::Protocol(format!(
                "placement covers {} chunks, sent {}",
                placement.targets.len(),
                ids.len()
            )));
        }
        if placement.is_degraded() {
            tracing::warn!(
                "Storing {} with {} of {} replicas",
                path,
                placement.achieved_replicas,
                placement.requested_replicas
            );
        }

        let transfers = placement
            .targets
            .iter()
            .zip(ids.iter().zip(pieces.iter()))
            .flat_map(|(targets, (id, piece))| {
                targets
                    .iter()
                    .map(move |addr| self.nodes.store_chunk(*addr, id, piece))
            });
        try_join_all(transfers).await?;

        protocol::write_frame(&mut master, path.as_bytes()).await?;
        protocol::expect_ok(&mut master).await.map_err(|e| typed(e, path))?;

        tracing::info!("Uploaded {} ({} chunks)", path, ids.len());
        Ok(UploadReport {
            chunks: ids.len(),
            bytes: data.len(),
            requested_replicas: placement.requested_replicas,
            achieved_replicas: placement.achieved_replicas,
        })
    }

    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let mut master = self.connect(CMD_RETRIEVE).await?;
        protocol::write_frame(&mut master, path.as_bytes()).await?;
        protocol::expect_ok(&mut master).await.map_err(|e| typed(e, path))?;
        let reply =
            RetrievalReply::decode(protocol::read_frame(&mut master, 64 * 1024 * 1024).await?)?;

        let chunks = try_join_all(reply.chunks.iter().map(|(id, addr)| async move {
            let data = self.nodes.retrieve_chunk(*addr, id).await?;
            if !id.verify(&data) {
                return Err(Error::Protocol(format!(
                    "chunk {} from {} does not match its id",
                    id, addr
                )));
            }
            Ok(data)
        }))
        .await?;

        let mut out = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
        for chunk in chunks {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let mut master = self.connect(CMD_DELETE).await?;
        protocol::write_frame(&mut master, path.as_bytes()).await?;
        protocol::expect_ok(&mut master).await.map_err(|e| typed(e, path))
    }
}

/// Map master status codes onto the matching error variants
fn typed(err: Error, path: &str) -> Error {
    match err {
        Error::Remote(Status::NoNodesAvailable) => Error::NoNodesAvailable,
        Error::Remote(Status::NotFound) => Error::NotFound(path.to_string()),
        other => other,
    }
}

/// Split `data` into at most `pieces` contiguous chunks of near-equal size
///
/// An empty file has no chunks.
pub fn split_chunks(data: &[u8], pieces: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    let size = data.len().div_ceil(pieces.max(1));
    data.chunks(size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_even() {
        let data = vec![7u8; 10];
        let pieces = split_chunks(&data, 3);
        assert_eq!(
            pieces.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert_eq!(pieces.concat(), data);
    }

    #[test]
    fn test_split_chunks_small_input() {
        let data = b"ab";
        assert_eq!(split_chunks(data, 5).len(), 2);
        assert_eq!(split_chunks(data, 1), vec![&b"ab"[..]]);
        assert!(split_chunks(b"", 3).is_empty());
    }

    #[test]
    fn test_typed_errors() {
        assert!(matches!(
            typed(Error::Remote(Status::NotFound), "/x"),
            Error::NotFound(p) if p == "/x"
        ));
        assert!(matches!(
            typed(Error::Remote(Status::NoNodesAvailable), "/x"),
            Error::NoNodesAvailable
        ));
    }
}
