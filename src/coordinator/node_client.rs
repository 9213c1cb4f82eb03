//! Outbound connections to storage nodes
//!
//! Every call opens a short-lived TCP connection and runs the whole exchange
//! under one deadline. Connection failures and expired deadlines surface as
//! `Error::Unreachable`; a node that answers with a failure status surfaces
//! as `Error::Remote`.

use crate::common::protocol::{
    self, CMD_DELETE_CHUNK, CMD_PROBE, CMD_RETRIEVE_CHUNK, CMD_STORE_CHUNK, DEFAULT_MAX_FRAME_LEN,
};
use crate::common::{with_timeout, ChunkId, Error, Result};
use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Client for the node-facing side of the protocol
#[derive(Debug, Clone)]
pub struct StorageNodeClient {
    timeout: Duration,
    max_frame_len: usize,
}

impl StorageNodeClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Send the membership probe and read the node's current id
    ///
    /// The connection stays open so an unassigned node can be told its id.
    pub async fn probe(&self, addr: SocketAddr) -> Result<ProbeSession> {
        self.bounded(addr, "probe", async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_u8(CMD_PROBE).await?;
            stream.flush().await?;
            let reported_id = stream.read_u8().await?;
            Ok::<_, Error>(ProbeSession {
                stream,
                addr,
                reported_id,
                timeout: self.timeout,
            })
        })
        .await
    }

    pub async fn store_chunk(&self, addr: SocketAddr, chunk_id: &ChunkId, data: &[u8]) -> Result<()> {
        self.bounded(addr, "store chunk", async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_u8(CMD_STORE_CHUNK).await?;
            stream.write_all(chunk_id.as_bytes()).await?;
            protocol::write_frame(&mut stream, data).await?;
            protocol::expect_ok(&mut stream).await
        })
        .await
    }

    /// Delete a chunk; an absent chunk is reported as success by the node
    pub async fn delete_chunk(&self, addr: SocketAddr, chunk_id: &ChunkId) -> Result<()> {
        self.bounded(addr, "delete chunk", async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_u8(CMD_DELETE_CHUNK).await?;
            stream.write_all(chunk_id.as_bytes()).await?;
            stream.flush().await?;
            protocol::expect_ok(&mut stream).await
        })
        .await
    }

    pub async fn retrieve_chunk(&self, addr: SocketAddr, chunk_id: &ChunkId) -> Result<Bytes> {
        self.bounded(addr, "retrieve chunk", async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_u8(CMD_RETRIEVE_CHUNK).await?;
            stream.write_all(chunk_id.as_bytes()).await?;
            stream.flush().await?;
            protocol::expect_ok(&mut stream).await?;
            protocol::read_frame(&mut stream, self.max_frame_len).await
        })
        .await
    }

    async fn bounded<T, F>(&self, addr: SocketAddr, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        with_timeout(self.timeout, what, fut)
            .await
            .map_err(|e| unreachable(addr, e))
    }
}

/// Open probe connection to a node that has reported its id
#[derive(Debug)]
pub struct ProbeSession {
    stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
    pub reported_id: u8,
}

impl ProbeSession {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tell an unassigned node which id it now holds
    pub async fn assign(mut self, id: u8) -> Result<()> {
        let addr = self.addr;
        with_timeout(self.timeout, "assign id", async {
            self.stream.write_u8(id).await?;
            self.stream.flush().await?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| unreachable(addr, e))
    }
}

fn unreachable(addr: SocketAddr, err: Error) -> Error {
    match err {
        Error::Io(_) | Error::Timeout(_) => Error::Unreachable {
            addr,
            reason: err.to_string(),
        },
        other => other,
    }
}
