//! Content-addressed chunk storage
//!
//! Layout:
//! - Chunk files: data/chunks/aa/bb/<chunk id hex>
//! - Assigned node id: data/node_id
//!
//! Writes go to a temporary file that is renamed into place, so a chunk file
//! is either absent or complete.

use crate::common::protocol::{MAX_NODE_ID, MIN_NODE_ID, UNASSIGNED_NODE_ID};
use crate::common::{blob_prefix, ChunkId, Error, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

const CHUNKS_DIR: &str = "chunks";
const NODE_ID_FILE: &str = "node_id";

/// Chunk storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub chunks: usize,
    pub total_bytes: u64,
}

pub struct BlobStore {
    data_path: PathBuf,
    node_id: AtomicU8,
}

impl BlobStore {
    /// Open or create a chunk store rooted at `data_path`
    pub fn open(data_path: &Path) -> Result<Self> {
        fs::create_dir_all(data_path.join(CHUNKS_DIR))?;

        let node_id = match fs::read(data_path.join(NODE_ID_FILE)) {
            Ok(raw) => parse_node_id(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => UNASSIGNED_NODE_ID,
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "BlobStore opened at {} (node id {})",
            data_path.display(),
            node_id
        );

        Ok(Self {
            data_path: data_path.to_path_buf(),
            node_id: AtomicU8::new(node_id),
        })
    }

    /// Id assigned by the master, `0` until the first probe
    pub fn node_id(&self) -> u8 {
        self.node_id.load(Ordering::SeqCst)
    }

    /// Persist the id the master assigned
    pub fn set_node_id(&self, id: u8) -> Result<()> {
        if !(MIN_NODE_ID..=MAX_NODE_ID).contains(&id) {
            return Err(Error::InvalidRequest(format!("node id {} out of range", id)));
        }
        write_atomic(&self.data_path.join(NODE_ID_FILE), id.to_string().as_bytes())?;
        self.node_id.store(id, Ordering::SeqCst);
        Ok(())
    }

    /// Store a chunk after checking it hashes to `id`
    pub fn put(&self, id: &ChunkId, data: &[u8]) -> Result<()> {
        if !id.verify(data) {
            return Err(Error::InvalidRequest(format!(
                "payload does not hash to chunk {}",
                id
            )));
        }

        let path = self.chunk_path(id);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, data)
    }

    pub fn get(&self, id: &ChunkId) -> Result<Option<Vec<u8>>> {
        match fs::read(self.chunk_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a chunk; returns whether it existed
    pub fn delete(&self, id: &ChunkId) -> Result<bool> {
        match fs::remove_file(self.chunk_path(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunk_path(id).is_file()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for aa in fs::read_dir(self.data_path.join(CHUNKS_DIR))? {
            for bb in fs::read_dir(aa?.path())? {
                for chunk in fs::read_dir(bb?.path())? {
                    let meta = chunk?.metadata()?;
                    if meta.is_file() {
                        stats.chunks += 1;
                        stats.total_bytes += meta.len();
                    }
                }
            }
        }
        Ok(stats)
    }

    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let (aa, bb) = blob_prefix(id);
        self.data_path
            .join(CHUNKS_DIR)
            .join(aa)
            .join(bb)
            .join(id.to_hex())
    }
}

fn parse_node_id(raw: &[u8]) -> Result<u8> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::InvalidConfig("node id file is not UTF-8".into()))?;
    let id: u8 = text
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid node id {:?}", text.trim())))?;
    if id == UNASSIGNED_NODE_ID || (MIN_NODE_ID..=MAX_NODE_ID).contains(&id) {
        Ok(id)
    } else {
        Err(Error::InvalidConfig(format!("node id {} out of range", id)))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_blobstore_put_get() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let id = ChunkId::of(b"chunk data");
        store.put(&id, b"chunk data").unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.get(&id).unwrap().unwrap(), b"chunk data");

        let stats = store.stats().unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.total_bytes, 10);
    }

    #[test]
    fn test_blobstore_rejects_mismatched_payload() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let id = ChunkId::of(b"expected");
        let err = store.put(&id, b"something else").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_blobstore_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let id = ChunkId::of(b"x");
        store.put(&id, b"x").unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(!store.delete(&id).unwrap());
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_node_id_persists() {
        let dir = tempdir().unwrap();
        {
            let store = BlobStore::open(dir.path()).unwrap();
            assert_eq!(store.node_id(), 0);
            store.set_node_id(12).unwrap();
            assert!(store.set_node_id(255).is_err());
        }
        let store = BlobStore::open(dir.path()).unwrap();
        assert_eq!(store.node_id(), 12);
    }
}
