//! Replica placement
//!
//! Chunks are spread round-robin over the online nodes, ordered by node id.
//! Chunk `i` goes to `online[(i + k) % N]` for `k` in `0..R`, where
//! `R = min(replicas, N)`, so the `R` replicas of a chunk always land on
//! distinct nodes and consecutive chunks start on consecutive nodes.

use crate::common::{ChunkId, Result};
use crate::common::protocol::PlacementReply;
use crate::coordinator::metadata::NodeRecord;

/// Nodes chosen for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub chunk_id: ChunkId,
    pub nodes: Vec<NodeRecord>,
}

/// Placement of every chunk of one upload, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementPlan {
    pub requested_replicas: usize,
    pub achieved_replicas: usize,
    pub assignments: Vec<ChunkAssignment>,
}

impl PlacementPlan {
    /// Fewer replicas than configured because too few nodes are online
    pub fn is_degraded(&self) -> bool {
        self.achieved_replicas < self.requested_replicas
    }

    /// Wire form sent back to the uploading client
    pub fn to_reply(&self) -> PlacementReply {
        PlacementReply {
            requested_replicas: clamp_u8(self.requested_replicas),
            achieved_replicas: clamp_u8(self.achieved_replicas),
            targets: self
                .assignments
                .iter()
                .map(|a| a.nodes.iter().map(|n| n.address).collect())
                .collect(),
        }
    }
}

fn clamp_u8(n: usize) -> u8 {
    u8::try_from(n).unwrap_or(u8::MAX)
}

/// PlacementPolicy maps an upload's chunks onto a snapshot of online nodes
#[derive(Debug, Clone, Copy)]
pub struct PlacementPolicy {
    replicas: usize,
}

impl PlacementPolicy {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Assign replicas for `chunks`
    ///
    /// Offline nodes in `nodes` are ignored; the rest are ordered by id so the
    /// same snapshot always yields the same plan.
    pub fn place(&self, chunks: &[ChunkId], nodes: &[NodeRecord]) -> Result<PlacementPlan> {
        let mut online: Vec<&NodeRecord> = nodes.iter().filter(|n| n.online).collect();
        if online.is_empty() {
            return Err(crate::Error::NoNodesAvailable);
        }
        online.sort_by_key(|n| n.id);

        let n = online.len();
        let r = self.replicas.min(n);

        let assignments = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk_id)| ChunkAssignment {
                chunk_id: *chunk_id,
                nodes: (0..r).map(|k| online[(i + k) % n].clone()).collect(),
            })
            .collect();

        Ok(PlacementPlan {
            requested_replicas: self.replicas,
            achieved_replicas: r,
            assignments,
        })
    }
}
