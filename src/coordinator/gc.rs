//! Garbage collector
//!
//! Finishes deletions the delete path could not complete: every cycle walks
//! the soft-deleted files and the orphaned chunks, re-dispatches chunk deletes
//! to online replicas and purges metadata rows once nothing is left on disk.
//! Offline replicas are retried on a later cycle.

use crate::common::{ChunkId, MetricsRegistry, Result};
use crate::coordinator::metadata::{FileRecord, MetadataStore, NodeRecord, PlacementRemoval};
use crate::coordinator::node_client::StorageNodeClient;
use futures_util::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub files_visited: usize,
    pub files_purged: usize,
    pub orphans_visited: usize,
    pub placements_removed: usize,
}

pub struct GarbageCollector {
    store: Arc<MetadataStore>,
    client: StorageNodeClient,
    metrics: Arc<MetricsRegistry>,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<MetadataStore>,
        client: StorageNodeClient,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            client,
            metrics,
        }
    }

    /// One sweep over deleted files and orphaned chunks
    pub async fn run_cycle(&self) -> Result<GcSummary> {
        let mut summary = GcSummary::default();

        for file in self.store.deleted_files()? {
            summary.files_visited += 1;
            match self.reclaim_file(&file).await {
                Ok((removed, purged)) => {
                    summary.placements_removed += removed;
                    if purged {
                        summary.files_purged += 1;
                    }
                }
                Err(e) => tracing::error!("GC failed for {}: {}", file.path, e),
            }
        }

        for chunk_id in self.store.orphans()? {
            summary.orphans_visited += 1;
            match self.reclaim_chunk(&chunk_id, None).await {
                Ok(removed) => summary.placements_removed += removed,
                Err(e) => tracing::error!("GC failed for orphan chunk {}: {}", chunk_id, e),
            }
        }

        self.metrics.gc_cycles_total.inc();
        Ok(summary)
    }

    /// Reclaim every chunk of a deleted file, then purge the file row if drained
    ///
    /// Returns the number of placements removed and whether the row was purged.
    pub async fn reclaim_file(&self, file: &FileRecord) -> Result<(usize, bool)> {
        let mut removed = 0;
        for chunk_id in file.unique_chunks() {
            removed += self.reclaim_chunk(&chunk_id, Some(&file.path)).await?;
        }

        let purged = self.store.purge_file_if_drained(&file.path)?;
        if purged {
            self.metrics.files_purged_total.inc();
            tracing::info!(
                "Purged deleted file {} ({} chunks)",
                file.path,
                file.chunk_order.len()
            );
        }
        Ok((removed, purged))
    }

    /// Reclaim one chunk on behalf of `owner` (`None` for orphans)
    ///
    /// A chunk another live file still references is only detached from
    /// `owner`. Otherwise its online replicas are deleted and the chunk row is
    /// purged once no placement remains.
    pub async fn reclaim_chunk(&self, chunk_id: &ChunkId, owner: Option<&str>) -> Result<usize> {
        let Some(chunk) = self.store.get_chunk(chunk_id)? else {
            self.store.purge_chunk_if_evacuated(chunk_id, owner)?;
            return Ok(0);
        };

        let shared = chunk.files.iter().any(|f| Some(f.as_str()) != owner);
        if shared {
            match owner {
                Some(path) => {
                    if self.store.detach_file(chunk_id, path)? {
                        tracing::debug!("Detached {} from shared chunk {}", path, chunk_id);
                    }
                }
                None => {
                    self.store.purge_chunk_if_evacuated(chunk_id, None)?;
                }
            }
            return Ok(0);
        }

        let mut removed = 0;
        for placement in self.store.placements(chunk_id)? {
            if placement.node.is_none() {
                // Node row was replaced; nothing left to contact
                let removal = self
                    .store
                    .remove_placement(chunk_id, placement.node_id, owner)?;
                if removal != PlacementRemoval::Retained {
                    removed += 1;
                }
            }
        }

        let targets = self.store.begin_reclaim(chunk_id, owner)?;
        removed += self.dispatch_deletes(targets, owner).await;
        self.store.purge_chunk_if_evacuated(chunk_id, owner)?;
        Ok(removed)
    }

    /// Send chunk deletes concurrently, removing each acknowledged placement
    ///
    /// `targets` come from `MetadataStore::mark_deleted` or `begin_reclaim`;
    /// their reclaim marks are dropped once every delete has been answered.
    /// Failures are logged and left for a later cycle.
    pub async fn dispatch_deletes(
        &self,
        targets: Vec<(ChunkId, NodeRecord)>,
        owner: Option<&str>,
    ) -> usize {
        let results = join_all(targets.iter().map(|(chunk_id, node)| async move {
            match self.client.delete_chunk(node.address, chunk_id).await {
                Ok(()) => match self.store.remove_placement(chunk_id, node.id, owner) {
                    Ok(PlacementRemoval::Retained) => {
                        tracing::warn!(
                            "Chunk {} gained a reference during reclaim, placement on node {} kept",
                            chunk_id,
                            node.id
                        );
                        false
                    }
                    Ok(removal) => {
                        self.metrics.placements_reclaimed_total.inc();
                        if removal == PlacementRemoval::ChunkPurged {
                            tracing::debug!("Chunk {} fully evacuated", chunk_id);
                        }
                        true
                    }
                    Err(e) => {
                        tracing::error!(
                            "Chunk {} deleted on node {} but placement removal failed: {}",
                            chunk_id,
                            node.id,
                            e
                        );
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        "Delete of chunk {} on node {} deferred: {}",
                        chunk_id,
                        node.id,
                        e
                    );
                    false
                }
            }
        }))
        .await;

        let chunks: BTreeSet<ChunkId> = targets.iter().map(|(chunk_id, _)| *chunk_id).collect();
        for chunk_id in &chunks {
            if let Err(e) = self.store.end_reclaim(chunk_id) {
                tracing::error!("Failed to clear reclaim mark of chunk {}: {}", chunk_id, e);
            }
        }

        results.into_iter().filter(|ok| *ok).count()
    }
}

/// Spawn the periodic collection loop
pub fn start_gc_task(
    gc: Arc<GarbageCollector>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match gc.run_cycle().await {
                    Ok(summary) if summary.placements_removed > 0 || summary.files_purged > 0 => {
                        tracing::info!(
                            "GC cycle: {} placements removed, {} files purged",
                            summary.placements_removed,
                            summary.files_purged
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("GC cycle failed: {}", e),
                },
                _ = shutdown.changed() => {
                    tracing::info!("Garbage collector stopped");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::protocol::{self, Status, CMD_DELETE_CHUNK};
    use crate::common::Error;
    use crate::coordinator::metadata::DeleteOutcome;
    use crate::coordinator::placement::{PlacementPlan, PlacementPolicy};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Acknowledges chunk deletes and records the ids it received
    async fn fake_node() -> (SocketAddr, Arc<Mutex<Vec<ChunkId>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let log = deleted.clone();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = listener.accept().await {
                if s.read_u8().await.ok() != Some(CMD_DELETE_CHUNK) {
                    continue;
                }
                let id = protocol::read_chunk_id(&mut s).await.unwrap();
                log.lock().unwrap().push(id);
                protocol::write_status(&mut s, Status::Ok).await.unwrap();
            }
        });
        (addr, deleted)
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<MetadataStore>,
        gc: GarbageCollector,
        nodes: Vec<(SocketAddr, Arc<Mutex<Vec<ChunkId>>>)>,
    }

    async fn fixture(node_count: u8) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path(), Duration::from_millis(200)).unwrap());
        let mut nodes = Vec::new();
        for id in 1..=node_count {
            let (addr, log) = fake_node().await;
            store.observe_node(addr, id).unwrap();
            nodes.push((addr, log));
        }
        let gc = GarbageCollector::new(
            store.clone(),
            StorageNodeClient::new(Duration::from_millis(300)),
            Arc::new(MetricsRegistry::new()),
        );
        Fixture {
            _dir: dir,
            store,
            gc,
            nodes,
        }
    }

    fn upload(store: &MetadataStore, path: &str, chunks: &[&[u8]]) -> FileRecord {
        let ids: Vec<ChunkId> = chunks.iter().map(|c| ChunkId::of(c)).collect();
        let plan = PlacementPolicy::new(3)
            .place(&ids, &store.online_nodes().unwrap())
            .unwrap();
        store.commit_upload(path, &plan).unwrap()
    }

    #[tokio::test]
    async fn test_deleted_file_fully_reclaimed() {
        let f = fixture(2).await;
        let file = upload(&f.store, "/f", &[b"a", b"b"]);
        f.store.mark_deleted("/f").unwrap();

        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.placements_removed, 4);
        assert_eq!(summary.files_purged, 1);

        assert!(f.store.get_file("/f").unwrap().is_none());
        for chunk_id in &file.chunk_order {
            assert!(f.store.get_chunk(chunk_id).unwrap().is_none());
        }
        for (_, log) in &f.nodes {
            assert_eq!(log.lock().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_offline_replica_defers_purge() {
        let f = fixture(2).await;
        upload(&f.store, "/f", &[b"a"]);
        f.store.mark_deleted("/f").unwrap();
        f.store.set_online(&f.nodes[1].0, false).unwrap();

        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.placements_removed, 1);
        assert_eq!(summary.files_purged, 0);
        assert!(f.store.get_file("/f").unwrap().is_some());

        // Node comes back, next cycle finishes the job
        f.store.set_online(&f.nodes[1].0, true).unwrap();
        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.files_purged, 1);
        assert!(f.store.get_file("/f").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shared_chunk_only_detached() {
        let f = fixture(1).await;
        upload(&f.store, "/a", &[b"shared"]);
        upload(&f.store, "/b", &[b"shared"]);
        f.store.mark_deleted("/a").unwrap();

        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.placements_removed, 0);
        assert_eq!(summary.files_purged, 1);

        let chunk = f.store.get_chunk(&ChunkId::of(b"shared")).unwrap().unwrap();
        assert_eq!(chunk.files.len(), 1);
        assert!(chunk.files.contains("/b"));
        assert_eq!(f.store.placements(&chunk.chunk_id).unwrap().len(), 1);
        assert!(f.nodes[0].1.lock().unwrap().is_empty());
        assert!(f.store.resolve_retrieval("/b").is_ok());
    }

    fn plan_for(store: &MetadataStore, chunk: &[u8]) -> PlacementPlan {
        PlacementPolicy::new(3)
            .place(&[ChunkId::of(chunk)], &store.online_nodes().unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_during_delete_dispatch_keeps_its_chunk() {
        let f = fixture(1).await;
        upload(&f.store, "/f", &[b"same"]);
        let x = ChunkId::of(b"same");

        let targets = match f.store.mark_deleted("/f").unwrap() {
            DeleteOutcome::Deleted { targets, .. } => targets,
            other => panic!("unexpected {:?}", other),
        };

        // Identical content lands while the delete is still queued
        let plan = plan_for(&f.store, b"same");
        let err = f.store.commit_upload("/g", &plan).unwrap_err();
        assert!(matches!(err, Error::ChunkReclaiming(_)));

        assert_eq!(f.gc.dispatch_deletes(targets, Some("/f")).await, 1);
        assert_eq!(*f.nodes[0].1.lock().unwrap(), vec![x]);
        assert!(f.store.get_chunk(&x).unwrap().is_none());

        // Retried upload after the reclaim finished
        f.store.commit_upload("/g", &plan).unwrap();
        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.files_purged, 1);
        assert_eq!(summary.placements_removed, 0);

        assert_eq!(f.nodes[0].1.lock().unwrap().len(), 1);
        assert_eq!(f.store.placements(&x).unwrap().len(), 1);
        assert_eq!(f.store.resolve_retrieval("/g").unwrap()[0].0, x);
    }

    #[tokio::test]
    async fn test_gc_skips_chunks_pinned_by_upload() {
        let f = fixture(1).await;
        upload(&f.store, "/f", &[b"same"]);
        let x = ChunkId::of(b"same");

        let pins = f.store.pin_chunks(&[x]).unwrap();
        match f.store.mark_deleted("/f").unwrap() {
            DeleteOutcome::Deleted { targets, .. } => assert!(targets.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.placements_removed, 0);
        assert_eq!(summary.files_purged, 0);
        assert!(f.nodes[0].1.lock().unwrap().is_empty());

        f.store.commit_upload("/g", &plan_for(&f.store, b"same")).unwrap();
        drop(pins);

        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.files_purged, 1);
        assert!(f.nodes[0].1.lock().unwrap().is_empty());
        assert!(f.store.resolve_retrieval("/g").is_ok());
    }

    #[tokio::test]
    async fn test_orphans_reclaimed() {
        let f = fixture(1).await;
        upload(&f.store, "/f", &[b"old"]);
        upload(&f.store, "/f", &[b"new"]);
        assert_eq!(f.store.orphans().unwrap().len(), 1);

        let summary = f.gc.run_cycle().await.unwrap();
        assert_eq!(summary.orphans_visited, 1);
        assert_eq!(summary.placements_removed, 1);
        assert!(f.store.orphans().unwrap().is_empty());
        assert!(f.store.get_chunk(&ChunkId::of(b"old")).unwrap().is_none());
        assert_eq!(*f.nodes[0].1.lock().unwrap(), vec![ChunkId::of(b"old")]);
    }
}
