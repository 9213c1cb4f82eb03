//! Metadata store using RocksDB pessimistic transactions
//!
//! Stores:
//! - Node registry (id → address, liveness) plus an address index
//! - File records (path → ordered chunk ids, soft-delete flag)
//! - Chunk records (chunk id → referencing files) and chunk placements
//! - Orphaned chunks awaiting reclamation
//!
//! Every multi-row operation runs in one transaction. Rows a transaction
//! mutates are locked with `get_for_update`, so operations on unrelated paths
//! never wait on each other while same-path operations serialize. Lock
//! conflicts are retried a bounded number of times; any other failure rolls
//! the transaction back.

use crate::common::protocol::{MAX_NODE_ID, MIN_NODE_ID};
use crate::common::{timestamp_now, ChunkId, Error, Result, CHUNK_ID_LEN};
use crate::coordinator::placement::PlacementPlan;
use rocksdb::{
    ColumnFamily, Direction, IteratorMode, Options, Transaction, TransactionDB,
    TransactionDBOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const CF_NODES: &str = "nodes";
const CF_NODE_ADDRS: &str = "node_addrs";
const CF_FILES: &str = "files";
const CF_CHUNKS: &str = "chunks";
const CF_PLACEMENTS: &str = "placements";
const CF_ORPHANS: &str = "orphans";
const CF_CONFIG: &str = "config";

const ALL_CFS: [&str; 7] = [
    CF_NODES,
    CF_NODE_ADDRS,
    CF_FILES,
    CF_CHUNKS,
    CF_PLACEMENTS,
    CF_ORPHANS,
    CF_CONFIG,
];

/// Sentinel row locked by every transaction that changes the set of node ids
const NODE_ALLOC_KEY: &[u8] = b"node_id_alloc";

const MAX_TXN_RETRIES: usize = 3;

pub type NodeId = u8;

type Txn<'a> = Transaction<'a, TransactionDB>;

/// Storage node registered with the master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: SocketAddr,
    pub online: bool,
    pub last_seen: i64,
}

/// File metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    /// Ordered ids needed to reassemble the file; fixed at upload
    pub chunk_order: Vec<ChunkId>,
    pub deleted: bool,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl FileRecord {
    /// Distinct chunk ids of this file (a chunk may repeat in `chunk_order`)
    pub fn unique_chunks(&self) -> BTreeSet<ChunkId> {
        self.chunk_order.iter().copied().collect()
    }
}

/// Chunk metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    /// Paths whose chunk order references this chunk
    pub files: BTreeSet<String>,
    pub created_at: i64,
    /// Delete dispatches in flight; uploads naming the chunk are refused
    pub reclaiming: u32,
}

impl ChunkRecord {
    /// True when nothing but `owner` (or nothing at all) references the chunk
    fn only_referenced_by(&self, owner: Option<&str>) -> bool {
        self.files.iter().all(|f| Some(f.as_str()) == owner)
    }
}

/// A placement row joined with the node it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub node_id: NodeId,
    /// `None` when the node row was removed by a conflict repair
    pub node: Option<NodeRecord>,
}

/// Result of reconciling a probe reply with the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeObservation {
    /// Id matches the row on file for this address
    Confirmed { record: NodeRecord, was_online: bool },
    /// Neither id nor address was on file
    Adopted(NodeRecord),
    /// Id/address mismatch; stale rows were replaced
    Repaired {
        record: NodeRecord,
        removed: Vec<NodeRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    NotFound,
    AlreadyDeleted,
    Deleted {
        file: FileRecord,
        /// Online replicas of chunks referenced only by this file
        targets: Vec<(ChunkId, NodeRecord)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementRemoval {
    /// Placement removed, other replicas remain
    Removed,
    /// Chunk gained a live reference; the placement was kept
    Retained,
    /// Last placement removed and the chunk row purged
    ChunkPurged,
}

/// Row counts for the admin API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub online_nodes: usize,
    pub files: usize,
    pub deleted_files: usize,
    pub chunks: usize,
    pub placements: usize,
    pub orphans: usize,
}

/// Metadata store
pub struct MetadataStore {
    db: TransactionDB,
    /// Chunk id → uploads currently between placement and commit
    pins: Mutex<HashMap<ChunkId, usize>>,
}

/// Keeps chunks out of reclamation until dropped
///
/// Held by an upload from the placement reply through its commit, since the
/// client stores chunk bytes on the nodes in between.
pub struct ChunkPins<'a> {
    store: &'a MetadataStore,
    ids: Vec<ChunkId>,
}

impl Drop for ChunkPins<'_> {
    fn drop(&mut self) {
        let mut pins = self.store.lock_pins();
        for id in &self.ids {
            if let Some(count) = pins.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(id);
                }
            }
        }
    }
}

impl MetadataStore {
    /// Open or create metadata store
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(lock_timeout.as_millis() as i64);

        let db = TransactionDB::open_cf(&opts, &txn_opts, path, ALL_CFS)?;

        let store = Self {
            db,
            pins: Mutex::new(HashMap::new()),
        };
        store.clear_reclaim_marks()?;
        Ok(store)
    }

    /// No dispatch survives a restart, so leftover marks are stale
    fn clear_reclaim_marks(&self) -> Result<()> {
        let marked: Vec<ChunkRecord> = self
            .scan::<ChunkRecord>(CF_CHUNKS)?
            .into_iter()
            .filter(|c| c.reclaiming > 0)
            .collect();
        for chunk in &marked {
            self.with_txn(|txn| {
                if let Some(mut record) = self.chunk_for_update(txn, &chunk.chunk_id)? {
                    record.reclaiming = 0;
                    txn.put_cf(self.cf(CF_CHUNKS)?, chunk.chunk_id.as_bytes(), encode(&record)?)?;
                }
                Ok(())
            })?;
        }
        if !marked.is_empty() {
            tracing::info!("Cleared {} stale chunk reclaim marks", marked.len());
        }
        Ok(())
    }

    fn lock_pins(&self) -> MutexGuard<'_, HashMap<ChunkId, usize>> {
        self.pins.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_pinned(&self, chunk_id: &ChunkId) -> bool {
        self.lock_pins().contains_key(chunk_id)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::MetadataCorrupted(format!("missing column family {}", name)))
    }

    /// Run `f` inside a transaction, committing on success
    ///
    /// Lock conflicts restart the whole closure; `f` must not have side
    /// effects outside the transaction.
    fn with_txn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let txn = self.db.transaction();
            let result = match f(&txn) {
                Ok(value) => txn.commit().map(|_| value).map_err(Error::from),
                Err(e) => {
                    if let Err(rb) = txn.rollback() {
                        tracing::warn!("Metadata rollback failed: {}", rb);
                    }
                    Err(e)
                }
            };
            match result {
                Err(e) if e.is_retryable() && attempt < MAX_TXN_RETRIES => {
                    attempt += 1;
                    tracing::debug!("Metadata transaction conflict (attempt {}): {}", attempt, e);
                }
                other => return other,
            }
        }
    }

    // === Node operations ===

    pub fn get_node(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        self.db
            .get_cf(self.cf(CF_NODES)?, [id])?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn node_by_address(&self, addr: &SocketAddr) -> Result<Option<NodeRecord>> {
        let Some(raw) = self.db.get_cf(self.cf(CF_NODE_ADDRS)?, addr_key(addr))? else {
            return Ok(None);
        };
        let id = node_id_from(&raw)?;
        Ok(self.get_node(id)?.filter(|n| n.address == *addr))
    }

    /// All nodes, ordered by id
    pub fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.scan(CF_NODES)
    }

    /// Online nodes, ordered by id
    pub fn online_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.list_nodes()?.into_iter().filter(|n| n.online).collect())
    }

    /// Register a node that reported itself unassigned
    ///
    /// A row already on file for the address keeps its id. Otherwise the
    /// lowest free id in `[1, 254]` is chosen inside the inserting transaction,
    /// serialized against every other id-set change by the allocation row lock.
    pub fn allocate_node(&self, addr: SocketAddr) -> Result<NodeRecord> {
        self.with_txn(|txn| {
            let nodes = self.cf(CF_NODES)?;
            let addrs = self.cf(CF_NODE_ADDRS)?;
            let config = self.cf(CF_CONFIG)?;

            txn.get_for_update_cf(config, NODE_ALLOC_KEY, true)?;

            if let Some(raw) = txn.get_for_update_cf(addrs, addr_key(&addr), true)? {
                let id = node_id_from(&raw)?;
                if let Some(mut existing) = txn
                    .get_for_update_cf(nodes, [id], true)?
                    .map(|b| decode::<NodeRecord>(&b))
                    .transpose()?
                {
                    if existing.address == addr {
                        existing.online = true;
                        existing.last_seen = timestamp_now();
                        txn.put_cf(nodes, [id], encode(&existing)?)?;
                        return Ok(existing);
                    }
                }
                txn.delete_cf(addrs, addr_key(&addr))?;
            }

            let mut used = BTreeSet::new();
            for item in txn.iterator_cf(nodes, IteratorMode::Start) {
                let (key, _) = item?;
                used.insert(node_id_from(&key)?);
            }
            let id = (MIN_NODE_ID..=MAX_NODE_ID)
                .find(|candidate| !used.contains(candidate))
                .ok_or(Error::NodeIdsExhausted)?;

            let record = NodeRecord {
                id,
                address: addr,
                online: true,
                last_seen: timestamp_now(),
            };
            txn.put_cf(nodes, [id], encode(&record)?)?;
            txn.put_cf(addrs, addr_key(&addr), [id])?;
            txn.put_cf(config, NODE_ALLOC_KEY, [id])?;
            Ok(record)
        })
    }

    /// Reconcile a node's self-reported id with the rows on file
    pub fn observe_node(&self, addr: SocketAddr, id: NodeId) -> Result<NodeObservation> {
        self.with_txn(|txn| {
            let nodes = self.cf(CF_NODES)?;
            let addrs = self.cf(CF_NODE_ADDRS)?;
            let config = self.cf(CF_CONFIG)?;

            txn.get_for_update_cf(config, NODE_ALLOC_KEY, true)?;

            let id_at_addr = txn
                .get_for_update_cf(addrs, addr_key(&addr), true)?
                .map(|raw| node_id_from(&raw))
                .transpose()?;
            let row_for_id: Option<NodeRecord> = txn
                .get_for_update_cf(nodes, [id], true)?
                .map(|b| decode(&b))
                .transpose()?;

            let now = timestamp_now();
            let mut record = NodeRecord {
                id,
                address: addr,
                online: true,
                last_seen: now,
            };

            match (id_at_addr, &row_for_id) {
                (Some(on_file), Some(row)) if on_file == id && row.address == addr => {
                    txn.put_cf(nodes, [id], encode(&record)?)?;
                    Ok(NodeObservation::Confirmed {
                        record,
                        was_online: row.online,
                    })
                }
                (None, None) => {
                    txn.put_cf(nodes, [id], encode(&record)?)?;
                    txn.put_cf(addrs, addr_key(&addr), [id])?;
                    Ok(NodeObservation::Adopted(record))
                }
                _ => {
                    let mut removed = Vec::new();
                    if let Some(row) = row_for_id.clone() {
                        txn.delete_cf(nodes, [row.id])?;
                        txn.delete_cf(addrs, addr_key(&row.address))?;
                        removed.push(row);
                    }
                    if let Some(other) = id_at_addr.filter(|other| *other != id) {
                        if let Some(row) = txn
                            .get_for_update_cf(nodes, [other], true)?
                            .map(|b| decode::<NodeRecord>(&b))
                            .transpose()?
                        {
                            if row.address == addr {
                                txn.delete_cf(nodes, [other])?;
                                removed.push(row);
                            }
                        }
                    }
                    txn.delete_cf(addrs, addr_key(&addr))?;

                    record.last_seen = now;
                    txn.put_cf(nodes, [id], encode(&record)?)?;
                    txn.put_cf(addrs, addr_key(&addr), [id])?;
                    Ok(NodeObservation::Repaired { record, removed })
                }
            }
        })
    }

    /// Flip the liveness of the node registered at `addr`
    ///
    /// Returns the previous liveness and the updated row, or `None` when no
    /// node is registered at that address.
    pub fn set_online(&self, addr: &SocketAddr, online: bool) -> Result<Option<(bool, NodeRecord)>> {
        self.with_txn(|txn| {
            let nodes = self.cf(CF_NODES)?;
            let addrs = self.cf(CF_NODE_ADDRS)?;

            let Some(raw) = txn.get_cf(addrs, addr_key(addr))? else {
                return Ok(None);
            };
            let id = node_id_from(&raw)?;
            let Some(mut record) = txn
                .get_for_update_cf(nodes, [id], true)?
                .map(|b| decode::<NodeRecord>(&b))
                .transpose()?
            else {
                return Ok(None);
            };
            if record.address != *addr {
                return Ok(None);
            }

            let was_online = record.online;
            record.online = online;
            if online {
                record.last_seen = timestamp_now();
            }
            txn.put_cf(nodes, [id], encode(&record)?)?;
            Ok(Some((was_online, record)))
        })
    }

    // === File operations ===

    pub fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        self.db
            .get_cf(self.cf(CF_FILES)?, path.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.scan(CF_FILES)
    }

    pub fn deleted_files(&self) -> Result<Vec<FileRecord>> {
        Ok(self.list_files()?.into_iter().filter(|f| f.deleted).collect())
    }

    /// Record an upload: file row, chunk rows and every placement, atomically
    ///
    /// Every target node must still be online when the transaction runs;
    /// otherwise nothing is written and `NodeSetChanged` is returned. A chunk
    /// with deletes in flight fails the commit with `ChunkReclaiming`. An
    /// existing row for `path` is overwritten and chunks only the old version
    /// referenced are detached (and orphaned when nothing else refers to them).
    pub fn commit_upload(&self, path: &str, plan: &PlacementPlan) -> Result<FileRecord> {
        let target_ids: BTreeSet<NodeId> = plan
            .assignments
            .iter()
            .flat_map(|a| a.nodes.iter().map(|n| n.id))
            .collect();
        let new_chunks: BTreeSet<ChunkId> = plan.assignments.iter().map(|a| a.chunk_id).collect();

        self.with_txn(|txn| {
            let nodes = self.cf(CF_NODES)?;
            let files = self.cf(CF_FILES)?;
            let placements = self.cf(CF_PLACEMENTS)?;

            let mut still_online = 0;
            for id in &target_ids {
                let online = txn
                    .get_for_update_cf(nodes, [*id], false)?
                    .map(|b| decode::<NodeRecord>(&b))
                    .transpose()?
                    .is_some_and(|n| n.online);
                if online {
                    still_online += 1;
                }
            }
            if still_online < target_ids.len() {
                return Err(Error::NodeSetChanged {
                    advertised: target_ids.len(),
                    current: still_online,
                });
            }

            let previous: Option<FileRecord> = txn
                .get_for_update_cf(files, path.as_bytes(), true)?
                .map(|b| decode(&b))
                .transpose()?;

            let now = timestamp_now();
            for chunk_id in &new_chunks {
                let mut record = self
                    .chunk_for_update(txn, chunk_id)?
                    .unwrap_or_else(|| ChunkRecord {
                        chunk_id: *chunk_id,
                        files: BTreeSet::new(),
                        created_at: now,
                        reclaiming: 0,
                    });
                if record.reclaiming > 0 {
                    return Err(Error::ChunkReclaiming(*chunk_id));
                }
                record.files.insert(path.to_string());
                txn.put_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes(), encode(&record)?)?;
                txn.delete_cf(self.cf(CF_ORPHANS)?, chunk_id.as_bytes())?;
            }

            for assignment in &plan.assignments {
                for node in &assignment.nodes {
                    txn.put_cf(
                        placements,
                        placement_key(&assignment.chunk_id, node.id),
                        [],
                    )?;
                }
            }

            if let Some(previous) = &previous {
                for stale in previous.unique_chunks().difference(&new_chunks) {
                    self.detach_in(txn, stale, path)?;
                }
            }

            let record = FileRecord {
                path: path.to_string(),
                chunk_order: plan.assignments.iter().map(|a| a.chunk_id).collect(),
                deleted: false,
                created_at: now,
                deleted_at: None,
            };
            txn.put_cf(files, path.as_bytes(), encode(&record)?)?;
            Ok(record)
        })
    }

    /// Soft-delete a file
    ///
    /// The returned targets are the online replicas of chunks no other file
    /// references. Those chunks are marked as being reclaimed; the caller
    /// must hand the targets to `GarbageCollector::dispatch_deletes`, which
    /// clears the mark.
    pub fn mark_deleted(&self, path: &str) -> Result<DeleteOutcome> {
        let outcome = self.with_txn(|txn| {
            let files = self.cf(CF_FILES)?;

            let Some(mut file) = txn
                .get_for_update_cf(files, path.as_bytes(), true)?
                .map(|b| decode::<FileRecord>(&b))
                .transpose()?
            else {
                return Ok(DeleteOutcome::NotFound);
            };
            if file.deleted {
                return Ok(DeleteOutcome::AlreadyDeleted);
            }

            file.deleted = true;
            file.deleted_at = Some(timestamp_now());
            txn.put_cf(files, path.as_bytes(), encode(&file)?)?;

            let mut targets = Vec::new();
            for chunk_id in file.unique_chunks() {
                targets.extend(self.begin_reclaim_in(txn, &chunk_id, Some(path))?);
            }

            Ok(DeleteOutcome::Deleted { file, targets })
        })?;

        match outcome {
            DeleteOutcome::Deleted { file, targets } => Ok(DeleteOutcome::Deleted {
                file,
                targets: self.yield_to_uploads(targets)?,
            }),
            other => Ok(other),
        }
    }

    /// Remove a deleted file's row once none of its chunks still reference it
    pub fn purge_file_if_drained(&self, path: &str) -> Result<bool> {
        self.with_txn(|txn| {
            let files = self.cf(CF_FILES)?;
            let chunks = self.cf(CF_CHUNKS)?;

            let Some(file) = txn
                .get_for_update_cf(files, path.as_bytes(), true)?
                .map(|b| decode::<FileRecord>(&b))
                .transpose()?
            else {
                return Ok(false);
            };
            if !file.deleted {
                return Ok(false);
            }

            for chunk_id in file.unique_chunks() {
                let referenced = txn
                    .get_cf(chunks, chunk_id.as_bytes())?
                    .map(|b| decode::<ChunkRecord>(&b))
                    .transpose()?
                    .is_some_and(|c| c.files.contains(path));
                if referenced {
                    return Ok(false);
                }
            }

            txn.delete_cf(files, path.as_bytes())?;
            Ok(true)
        })
    }

    /// Resolve a live file to one online replica per chunk
    ///
    /// Holds a shared lock on the path, so a concurrent upload to the same
    /// path is observed either fully committed or not at all.
    pub fn resolve_retrieval(&self, path: &str) -> Result<Vec<(ChunkId, NodeRecord)>> {
        self.with_txn(|txn| {
            let file = txn
                .get_for_update_cf(self.cf(CF_FILES)?, path.as_bytes(), false)?
                .map(|b| decode::<FileRecord>(&b))
                .transpose()?
                .filter(|f| !f.deleted)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;

            let mut resolved = Vec::with_capacity(file.chunk_order.len());
            for chunk_id in &file.chunk_order {
                let replica = self
                    .placements_in(txn, chunk_id)?
                    .into_iter()
                    .filter_map(|p| p.node)
                    .find(|n| n.online)
                    .ok_or(Error::ChunkUnavailable(*chunk_id))?;
                resolved.push((*chunk_id, replica));
            }
            Ok(resolved)
        })
    }

    // === Chunk operations ===

    pub fn get_chunk(&self, chunk_id: &ChunkId) -> Result<Option<ChunkRecord>> {
        self.db
            .get_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Placements of a chunk, ordered by node id
    pub fn placements(&self, chunk_id: &ChunkId) -> Result<Vec<Placement>> {
        self.with_txn(|txn| self.placements_in(txn, chunk_id))
    }

    pub fn orphans(&self) -> Result<Vec<ChunkId>> {
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_ORPHANS)?, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(ChunkId::from_slice(&key)?);
        }
        Ok(ids)
    }

    /// Drop `path` from a chunk's references
    pub fn detach_file(&self, chunk_id: &ChunkId, path: &str) -> Result<bool> {
        self.with_txn(|txn| self.detach_in(txn, chunk_id, path))
    }

    /// Remove one placement after its node acknowledged the delete
    ///
    /// A chunk some file other than `owner` references keeps its placement.
    /// The chunk row is purged with its last placement.
    pub fn remove_placement(
        &self,
        chunk_id: &ChunkId,
        node_id: NodeId,
        owner: Option<&str>,
    ) -> Result<PlacementRemoval> {
        self.with_txn(|txn| {
            let record = self.chunk_for_update(txn, chunk_id)?;
            if record.is_some_and(|r| !r.only_referenced_by(owner)) {
                return Ok(PlacementRemoval::Retained);
            }

            txn.delete_cf(self.cf(CF_PLACEMENTS)?, placement_key(chunk_id, node_id))?;
            if self.placements_in(txn, chunk_id)?.is_empty() {
                self.delete_chunk_in(txn, chunk_id)?;
                Ok(PlacementRemoval::ChunkPurged)
            } else {
                Ok(PlacementRemoval::Removed)
            }
        })
    }

    /// Mark a chunk exclusively owned by `owner` (`None`: by nothing) as
    /// being reclaimed and return its online replicas
    ///
    /// Returns nothing when the chunk is gone, referenced elsewhere, pinned
    /// by an upload or has no online replica.
    pub fn begin_reclaim(
        &self,
        chunk_id: &ChunkId,
        owner: Option<&str>,
    ) -> Result<Vec<(ChunkId, NodeRecord)>> {
        let targets = self.with_txn(|txn| self.begin_reclaim_in(txn, chunk_id, owner))?;
        self.yield_to_uploads(targets)
    }

    /// Drop one reclaim mark once its delete dispatch finished
    pub fn end_reclaim(&self, chunk_id: &ChunkId) -> Result<()> {
        self.with_txn(|txn| {
            if let Some(mut record) = self.chunk_for_update(txn, chunk_id)? {
                record.reclaiming = record.reclaiming.saturating_sub(1);
                txn.put_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes(), encode(&record)?)?;
            }
            Ok(())
        })
    }

    /// Pin the chunks of an upload in progress
    ///
    /// Pinned chunks are never picked for reclamation. A chunk that already
    /// has deletes in flight fails with `ChunkReclaiming`.
    pub fn pin_chunks(&self, chunk_ids: &[ChunkId]) -> Result<ChunkPins<'_>> {
        let ids: Vec<ChunkId> = chunk_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        {
            let mut pins = self.lock_pins();
            for id in &ids {
                *pins.entry(*id).or_insert(0) += 1;
            }
        }
        let pins = ChunkPins { store: self, ids };

        // Pins are published before marks are read; reclaimers mark first and
        // check pins after, so at least one side backs off
        for id in &pins.ids {
            if self.get_chunk(id)?.is_some_and(|c| c.reclaiming > 0) {
                return Err(Error::ChunkReclaiming(*id));
            }
        }
        Ok(pins)
    }

    /// Purge a chunk row that has no placements left
    ///
    /// Orphan entries for chunks that regained a reference are dropped.
    pub fn purge_chunk_if_evacuated(&self, chunk_id: &ChunkId, owner: Option<&str>) -> Result<bool> {
        self.with_txn(|txn| {
            let Some(record) = self.chunk_for_update(txn, chunk_id)? else {
                txn.delete_cf(self.cf(CF_ORPHANS)?, chunk_id.as_bytes())?;
                return Ok(true);
            };
            if !record.only_referenced_by(owner) {
                if owner.is_none() {
                    txn.delete_cf(self.cf(CF_ORPHANS)?, chunk_id.as_bytes())?;
                }
                return Ok(false);
            }
            if !self.placements_in(txn, chunk_id)?.is_empty() {
                return Ok(false);
            }
            self.delete_chunk_in(txn, chunk_id)?;
            Ok(true)
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let nodes = self.list_nodes()?;
        let files = self.list_files()?;
        Ok(StoreStats {
            nodes: nodes.len(),
            online_nodes: nodes.iter().filter(|n| n.online).count(),
            files: files.iter().filter(|f| !f.deleted).count(),
            deleted_files: files.iter().filter(|f| f.deleted).count(),
            chunks: self.count(CF_CHUNKS)?,
            placements: self.count(CF_PLACEMENTS)?,
            orphans: self.count(CF_ORPHANS)?,
        })
    }


    // === Transaction-scoped helpers ===

    fn chunk_for_update(&self, txn: &Txn<'_>, chunk_id: &ChunkId) -> Result<Option<ChunkRecord>> {
        txn.get_for_update_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes(), true)?
            .map(|b| decode(&b))
            .transpose()
    }

    fn detach_in(&self, txn: &Txn<'_>, chunk_id: &ChunkId, path: &str) -> Result<bool> {
        let Some(mut record) = self.chunk_for_update(txn, chunk_id)? else {
            return Ok(false);
        };
        if !record.files.remove(path) {
            return Ok(false);
        }
        if record.files.is_empty() {
            txn.put_cf(self.cf(CF_ORPHANS)?, chunk_id.as_bytes(), [])?;
        }
        txn.put_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes(), encode(&record)?)?;
        Ok(true)
    }

    fn begin_reclaim_in(
        &self,
        txn: &Txn<'_>,
        chunk_id: &ChunkId,
        owner: Option<&str>,
    ) -> Result<Vec<(ChunkId, NodeRecord)>> {
        let Some(mut record) = self.chunk_for_update(txn, chunk_id)? else {
            return Ok(Vec::new());
        };
        if !record.only_referenced_by(owner) {
            return Ok(Vec::new());
        }

        let targets: Vec<(ChunkId, NodeRecord)> = self
            .placements_in(txn, chunk_id)?
            .into_iter()
            .filter_map(|p| p.node.filter(|n| n.online))
            .map(|node| (*chunk_id, node))
            .collect();
        if !targets.is_empty() {
            record.reclaiming += 1;
            txn.put_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes(), encode(&record)?)?;
        }
        Ok(targets)
    }

    /// Back out of reclaiming chunks an upload pinned in the meantime
    fn yield_to_uploads(
        &self,
        targets: Vec<(ChunkId, NodeRecord)>,
    ) -> Result<Vec<(ChunkId, NodeRecord)>> {
        let pinned: BTreeSet<ChunkId> = targets
            .iter()
            .map(|(chunk_id, _)| *chunk_id)
            .filter(|chunk_id| self.is_pinned(chunk_id))
            .collect();
        for chunk_id in &pinned {
            tracing::debug!("Chunk {} pinned by an upload, reclaim deferred", chunk_id);
            self.end_reclaim(chunk_id)?;
        }
        Ok(targets
            .into_iter()
            .filter(|(chunk_id, _)| !pinned.contains(chunk_id))
            .collect())
    }

    fn delete_chunk_in(&self, txn: &Txn<'_>, chunk_id: &ChunkId) -> Result<()> {
        txn.delete_cf(self.cf(CF_CHUNKS)?, chunk_id.as_bytes())?;
        txn.delete_cf(self.cf(CF_ORPHANS)?, chunk_id.as_bytes())?;
        Ok(())
    }

    fn placements_in(&self, txn: &Txn<'_>, chunk_id: &ChunkId) -> Result<Vec<Placement>> {
        let placements = self.cf(CF_PLACEMENTS)?;
        let nodes = self.cf(CF_NODES)?;
        let prefix = chunk_id.as_bytes();

        let mut node_ids = Vec::new();
        for item in txn.iterator_cf(placements, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            node_ids.push(split_placement_key(&key)?.1);
        }

        node_ids
            .into_iter()
            .map(|node_id| {
                let node = txn
                    .get_cf(nodes, [node_id])?
                    .map(|b| decode::<NodeRecord>(&b))
                    .transpose()?;
                Ok(Placement { node_id, node })
            })
            .collect()
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn count(&self, cf: &str) -> Result<usize> {
        let mut n = 0;
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            item?;
            n += 1;
        }
        Ok(n)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Internal(format!("Serialize error: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

fn addr_key(addr: &SocketAddr) -> Vec<u8> {
    addr.to_string().into_bytes()
}

fn node_id_from(raw: &[u8]) -> Result<NodeId> {
    match raw {
        [id] => Ok(*id),
        _ => Err(Error::MetadataCorrupted(format!(
            "node id must be one byte, got {}",
            raw.len()
        ))),
    }
}

fn placement_key(chunk_id: &ChunkId, node_id: NodeId) -> [u8; CHUNK_ID_LEN + 1] {
    let mut key = [0u8; CHUNK_ID_LEN + 1];
    key[..CHUNK_ID_LEN].copy_from_slice(chunk_id.as_bytes());
    key[CHUNK_ID_LEN] = node_id;
    key
}

fn split_placement_key(key: &[u8]) -> Result<(ChunkId, NodeId)> {
    if key.len() != CHUNK_ID_LEN + 1 {
        return Err(Error::MetadataCorrupted(format!(
            "placement key has {} bytes",
            key.len()
        )));
    }
    Ok((ChunkId::from_slice(&key[..CHUNK_ID_LEN])?, key[CHUNK_ID_LEN]))
}
