//! Wire protocol shared by the master, the storage nodes and the client
//!
//! Every exchange starts with one control byte. Variable-length payloads are
//! framed as a 4-byte big-endian length followed by that many bytes, so a
//! connection can carry several exchanges without relying on close-detection.
//!
//! ```text
//! 0xA0  master -> node    membership probe, reply = current id (0x00 unassigned)
//! 0xB0  client -> master  upload file      | master/client -> node  store chunk
//! 0xB1  client -> master  delete file      | master -> node         delete chunk
//! 0xB2  client -> master  retrieve file    | client -> node         retrieve chunk
//! ```

use crate::common::hash::{ChunkId, CHUNK_ID_LEN};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_PORT: u16 = 5900;

pub const CMD_PROBE: u8 = 0xA0;
pub const CMD_UPLOAD: u8 = 0xB0;
pub const CMD_DELETE: u8 = 0xB1;
pub const CMD_RETRIEVE: u8 = 0xB2;

/// Node-facing commands reuse the client-facing bytes
pub const CMD_STORE_CHUNK: u8 = CMD_UPLOAD;
pub const CMD_DELETE_CHUNK: u8 = CMD_DELETE;
pub const CMD_RETRIEVE_CHUNK: u8 = CMD_RETRIEVE;

pub const UNASSIGNED_NODE_ID: u8 = 0x00;
pub const MIN_NODE_ID: u8 = 1;
pub const MAX_NODE_ID: u8 = 254;

pub const MAX_PATH_LEN: usize = 1024;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Client-facing sub-protocols selected by the control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Upload,
    Delete,
    Retrieve,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            CMD_UPLOAD => Some(Command::Upload),
            CMD_DELETE => Some(Command::Delete),
            CMD_RETRIEVE => Some(Command::Retrieve),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Upload => "upload",
            Command::Delete => "delete",
            Command::Retrieve => "retrieve",
        }
    }
}

/// Status byte leading every reply that can fail
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0x00,
    NoNodesAvailable = 0x01,
    NodeSetChanged = 0x02,
    InvalidMetadata = 0x03,
    NotFound = 0x04,
    ChunkUnavailable = 0x05,
    Internal = 0x06,
    UnknownCommand = 0x07,
    InvalidRequest = 0x08,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Status::Ok),
            0x01 => Some(Status::NoNodesAvailable),
            0x02 => Some(Status::NodeSetChanged),
            0x03 => Some(Status::InvalidMetadata),
            0x04 => Some(Status::NotFound),
            0x05 => Some(Status::ChunkUnavailable),
            0x06 => Some(Status::Internal),
            0x07 => Some(Status::UnknownCommand),
            0x08 => Some(Status::InvalidRequest),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

// === Stream helpers ===

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: Status) -> Result<()> {
    w.write_u8(status as u8).await?;
    w.flush().await?;
    Ok(())
}

/// Read a status byte, turning anything but `Ok` into `Error::Remote`
pub async fn expect_ok<R: AsyncRead + Unpin>(r: &mut R) -> Result<()> {
    let byte = r.read_u8().await?;
    match Status::from_byte(byte) {
        Some(Status::Ok) => Ok(()),
        Some(status) => Err(Error::Remote(status)),
        None => Err(Error::Protocol(format!("unknown status byte {:#04x}", byte))),
    }
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max_len: usize) -> Result<Bytes> {
    let len = r.read_u32().await? as usize;
    if len > max_len {
        return Err(Error::InvalidRequest(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_len
        )));
    }
    let mut buf = BytesMut::zeroed(len);
    r.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidRequest(format!("payload too large: {}", payload.len())))?;
    w.write_u32(len).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read a framed UTF-8 file path
pub async fn read_path<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let raw = read_frame(r, MAX_PATH_LEN).await?;
    let path = String::from_utf8(raw.to_vec())
        .map_err(|_| Error::InvalidRequest("path is not valid UTF-8".into()))?;
    validate_path(&path)?;
    Ok(path)
}

pub async fn read_chunk_id<R: AsyncRead + Unpin>(r: &mut R) -> Result<ChunkId> {
    let mut id = [0u8; CHUNK_ID_LEN];
    r.read_exact(&mut id).await?;
    Ok(ChunkId(id))
}

/// Validate a file path (non-empty, bounded, no control characters)
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidRequest("path cannot be empty".into()));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(Error::InvalidRequest(format!(
            "path too long (max {} bytes)",
            MAX_PATH_LEN
        )));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(Error::InvalidRequest(
            "path contains control characters".into(),
        ));
    }
    Ok(())
}

// === Payload codecs ===

/// Split an upload's chunk metadata blob into 20-byte ids, preserving order
pub fn parse_chunk_ids(blob: &[u8]) -> Result<Vec<ChunkId>> {
    if blob.len() % CHUNK_ID_LEN != 0 {
        return Err(Error::InvalidMetadata(format!(
            "metadata length {} is not a multiple of {}",
            blob.len(),
            CHUNK_ID_LEN
        )));
    }
    blob.chunks_exact(CHUNK_ID_LEN)
        .map(ChunkId::from_slice)
        .collect()
}

pub fn encode_chunk_ids(ids: &[ChunkId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ids.len() * CHUNK_ID_LEN);
    for id in ids {
        buf.put_slice(id.as_bytes());
    }
    buf.freeze()
}

pub fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(ADDR_V4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(ADDR_V6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}

pub fn get_addr(buf: &mut Bytes) -> Result<SocketAddr> {
    ensure_remaining(buf, 1)?;
    let ip = match buf.get_u8() {
        ADDR_V4 => {
            ensure_remaining(buf, 4 + 2)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        ADDR_V6 => {
            ensure_remaining(buf, 16 + 2)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => {
            return Err(Error::Protocol(format!(
                "unknown address family {}",
                family
            )))
        }
    };
    Ok(SocketAddr::new(ip, buf.get_u16()))
}

fn ensure_remaining(buf: &Bytes, n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Protocol(format!(
            "truncated payload: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

/// Upload step 4 reply: where each chunk must be streamed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementReply {
    pub requested_replicas: u8,
    pub achieved_replicas: u8,
    /// One entry per chunk, in file order
    pub targets: Vec<Vec<SocketAddr>>,
}

impl PlacementReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.requested_replicas);
        buf.put_u8(self.achieved_replicas);
        buf.put_u32(self.targets.len() as u32);
        for nodes in &self.targets {
            buf.put_u8(nodes.len() as u8);
            for addr in nodes {
                put_addr(&mut buf, addr);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 6)?;
        let requested_replicas = buf.get_u8();
        let achieved_replicas = buf.get_u8();
        let count = buf.get_u32() as usize;
        let mut targets = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            ensure_remaining(&buf, 1)?;
            let replicas = buf.get_u8() as usize;
            let mut nodes = Vec::with_capacity(replicas);
            for _ in 0..replicas {
                nodes.push(get_addr(&mut buf)?);
            }
            targets.push(nodes);
        }
        Ok(Self {
            requested_replicas,
            achieved_replicas,
            targets,
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.achieved_replicas < self.requested_replicas
    }
}

/// Retrieve reply: one `(chunk_id, node)` pair per chunk, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalReply {
    pub chunks: Vec<(ChunkId, SocketAddr)>,
}

impl RetrievalReply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32(self.chunks.len() as u32);
        for (id, addr) in &self.chunks {
            buf.put_slice(id.as_bytes());
            put_addr(&mut buf, addr);
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 4)?;
        let count = buf.get_u32() as usize;
        let mut chunks = Vec::with_capacity(count.min(buf.remaining() / CHUNK_ID_LEN));
        for _ in 0..count {
            ensure_remaining(&buf, CHUNK_ID_LEN)?;
            let id = ChunkId::from_slice(&buf.split_to(CHUNK_ID_LEN))?;
            chunks.push((id, get_addr(&mut buf)?));
        }
        Ok(Self { chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_from_mock() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 5])
            .read(b"hello")
            .build();
        let frame = read_frame(&mut mock, 1024).await.unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut mock = tokio_test::io::Builder::new().read(&[0, 0, 4, 1]).build();
        let err = read_frame(&mut mock, 1024).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"/dir/file.txt").await.unwrap();
        let path = read_path(&mut b).await.unwrap();
        assert_eq!(path, "/dir/file.txt");
    }

    #[tokio::test]
    async fn test_expect_ok_maps_remote_status() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[Status::NotFound as u8])
            .build();
        let err = expect_ok(&mut mock).await.unwrap_err();
        assert!(matches!(err, Error::Remote(Status::NotFound)));
    }

    #[test]
    fn test_parse_chunk_ids() {
        let ids = vec![ChunkId::of(b"one"), ChunkId::of(b"two")];
        let parsed = parse_chunk_ids(&encode_chunk_ids(&ids)).unwrap();
        assert_eq!(parsed, ids);

        let err = parse_chunk_ids(&[0u8; 30]).unwrap_err();
        assert!(matches!(err, Error::InvalidMetadata(_)));
        assert!(parse_chunk_ids(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_placement_reply_mixed_families() {
        let reply = PlacementReply {
            requested_replicas: 3,
            achieved_replicas: 2,
            targets: vec![
                vec![
                    "10.0.0.1:5900".parse().unwrap(),
                    "[::1]:5901".parse().unwrap(),
                ],
                vec!["10.0.0.2:5900".parse().unwrap()],
            ],
        };
        let decoded = PlacementReply::decode(reply.encode()).unwrap();
        assert_eq!(decoded, reply);
        assert!(decoded.is_degraded());
    }

    #[test]
    fn test_truncated_retrieval_reply() {
        let reply = RetrievalReply {
            chunks: vec![(ChunkId::of(b"x"), "127.0.0.1:5900".parse().unwrap())],
        };
        let encoded = reply.encode();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(RetrievalReply::decode(truncated).is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/a.txt").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("bad\npath").is_err());
        assert!(validate_path(&"x".repeat(MAX_PATH_LEN + 1)).is_err());
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(Command::from_byte(0xB0), Some(Command::Upload));
        assert_eq!(Command::from_byte(0xB1), Some(Command::Delete));
        assert_eq!(Command::from_byte(0xB2), Some(Command::Retrieve));
        assert_eq!(Command::from_byte(0xA0), None);
        assert_eq!(Status::from_byte(0x09), None);
    }
}
