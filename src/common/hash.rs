//! Content addressing for chunks
//!
//! - Chunk ids are the first 160 bits of the BLAKE3 digest of the chunk bytes
//! - Blob prefixes spread chunk files over a two-level directory tree

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a chunk id on the wire and on disk
pub const CHUNK_ID_LEN: usize = 20;

/// Content hash identifying a chunk
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub [u8; CHUNK_ID_LEN]);

impl ChunkId {
    /// Hash chunk bytes into their id
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        let mut id = [0u8; CHUNK_ID_LEN];
        hasher.finalize_xof().fill(&mut id);
        Self(id)
    }

    /// Build an id from an exact 20-byte slice
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        let id: [u8; CHUNK_ID_LEN] = bytes.try_into().map_err(|_| {
            crate::Error::InvalidMetadata(format!(
                "chunk id must be {} bytes, got {}",
                CHUNK_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Check that `data` hashes to this id
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

/// Compute directory prefix for blob storage (2-level hierarchy)
///
/// Returns (aa, bb) where aa and bb are the first two bytes of the chunk id.
/// Ids are already uniformly distributed, so this balances the tree.
pub fn blob_prefix(id: &ChunkId) -> (String, String) {
    (format!("{:02x}", id.0[0]), format!("{:02x}", id.0[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_deterministic() {
        let a = ChunkId::of(b"hello world");
        let b = ChunkId::of(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, ChunkId::of(b"hello world!"));
        assert_eq!(a.to_hex().len(), 40);
    }

    #[test]
    fn test_chunk_id_is_blake3_prefix() {
        let full = blake3::hash(b"chunk");
        let id = ChunkId::of(b"chunk");
        assert_eq!(&full.as_bytes()[..CHUNK_ID_LEN], id.as_bytes());
    }

    #[test]
    fn test_from_slice_rejects_bad_length() {
        assert!(ChunkId::from_slice(&[0u8; 19]).is_err());
        assert!(ChunkId::from_slice(&[0u8; 32]).is_err());
        assert!(ChunkId::from_slice(&[7u8; 20]).is_ok());
    }

    #[test]
    fn test_verify() {
        let id = ChunkId::of(b"payload");
        assert!(id.verify(b"payload"));
        assert!(!id.verify(b"other"));
    }

    #[test]
    fn test_blob_prefix() {
        let id = ChunkId([0xab; CHUNK_ID_LEN]);
        let (aa, bb) = blob_prefix(&id);
        assert_eq!(aa, "ab");
        assert_eq!(bb, "ab");
    }
}
