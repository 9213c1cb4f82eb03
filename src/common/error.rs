//! Error types for rfs

use crate::common::hash::ChunkId;
use crate::common::protocol::Status;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Placement Errors ===
    #[error("No online storage nodes available")]
    NoNodesAvailable,

    #[error("Online node set changed during upload: advertised {advertised}, now {current}")]
    NodeSetChanged { advertised: usize, current: usize },

    // === Request Errors ===
    #[error("Invalid chunk metadata: {0}")]
    InvalidMetadata(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Chunk {0} has no online replica")]
    ChunkUnavailable(ChunkId),

    #[error("Chunk {0} is being reclaimed, retry the upload")]
    ChunkReclaiming(ChunkId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown control byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote replied with status {0:?}")]
    Remote(Status),

    // === Membership Errors ===
    #[error("Node {addr} unreachable: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },

    #[error("Node id/address conflict: id {id} at {address}")]
    Conflict { id: u8, address: SocketAddr },

    #[error("Node id space exhausted")]
    NodeIdsExhausted,

    // === Metadata Errors ===
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a transient store conflict worth retrying?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RocksDb(e) => matches!(
                e.kind(),
                rocksdb::ErrorKind::Busy
                    | rocksdb::ErrorKind::TimedOut
                    | rocksdb::ErrorKind::TryAgain
            ),
            _ => false,
        }
    }

    /// Status byte reported to the peer when a request fails with this error
    pub fn status(&self) -> Status {
        match self {
            Error::NoNodesAvailable => Status::NoNodesAvailable,
            Error::NodeSetChanged { .. } | Error::ChunkReclaiming(_) => Status::NodeSetChanged,
            Error::InvalidMetadata(_) => Status::InvalidMetadata,
            Error::NotFound(_) => Status::NotFound,
            Error::ChunkUnavailable(_) => Status::ChunkUnavailable,
            Error::UnknownCommand(_) => Status::UnknownCommand,
            Error::InvalidRequest(_) | Error::Protocol(_) => Status::InvalidRequest,
            Error::Remote(status) => *status,
            _ => Status::Internal,
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) | Error::InvalidRequest(_) | Error::InvalidMetadata(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NodeSetChanged { .. } | Error::ChunkReclaiming(_) => StatusCode::CONFLICT,
            Error::NoNodesAvailable | Error::ChunkUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NoNodesAvailable.status(), Status::NoNodesAvailable);
        assert_eq!(
            Error::NodeSetChanged {
                advertised: 3,
                current: 2
            }
            .status(),
            Status::NodeSetChanged
        );
        assert_eq!(Error::NotFound("/a".into()).status(), Status::NotFound);
        assert_eq!(
            Error::ChunkReclaiming(ChunkId::of(b"x")).status(),
            Status::NodeSetChanged
        );
        assert_eq!(Error::UnknownCommand(0x42).status(), Status::UnknownCommand);
        assert_eq!(
            Error::MetadataCorrupted("bad".into()).status(),
            Status::Internal
        );
    }

    #[test]
    fn test_http_status() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::NotFound("x".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::NoNodesAvailable.to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_io_is_not_retryable() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(!err.is_retryable());
    }
}
