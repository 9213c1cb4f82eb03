//! Node registry
//!
//! Turns probe outcomes into registry transitions: id assignment for new
//! nodes, liveness flips, adoption of unknown nodes and repair of id/address
//! conflicts. All state lives in the metadata store; this layer adds logging
//! and metrics around each transition.

use crate::common::protocol::UNASSIGNED_NODE_ID;
use crate::common::{Error, MetricsRegistry, Result};
use crate::coordinator::metadata::{MetadataStore, NodeObservation, NodeRecord};
use crate::coordinator::node_client::ProbeSession;
use std::net::SocketAddr;
use std::sync::Arc;

/// Reserved id byte; a node reporting it violates the protocol
pub const INVALID_NODE_ID: u8 = 0xFF;

pub struct NodeRegistry {
    store: Arc<MetadataStore>,
    metrics: Arc<MetricsRegistry>,
}

impl NodeRegistry {
    pub fn new(store: Arc<MetadataStore>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Apply a successful probe reply
    pub async fn handle_probe(&self, session: ProbeSession) -> Result<NodeRecord> {
        let addr = session.addr();
        match session.reported_id {
            UNASSIGNED_NODE_ID => self.assign(session).await,
            INVALID_NODE_ID => Err(Error::Protocol(format!(
                "node {} reported reserved id {:#04x}",
                addr, INVALID_NODE_ID
            ))),
            id => self.observe(addr, id),
        }
    }

    async fn assign(&self, session: ProbeSession) -> Result<NodeRecord> {
        let addr = session.addr();
        let known = self.store.node_by_address(&addr)?;

        // The row is committed before the node hears its id
        let record = self.store.allocate_node(addr)?;
        session.assign(record.id).await?;

        match known {
            Some(previous) if previous.id == record.id => {
                tracing::info!(
                    "Node {} at {} lost its id, re-sent existing assignment",
                    record.id,
                    addr
                );
            }
            _ => tracing::info!("New storage node {} registered at {}", record.id, addr),
        }
        Ok(record)
    }

    fn observe(&self, addr: SocketAddr, id: u8) -> Result<NodeRecord> {
        match self.store.observe_node(addr, id)? {
            NodeObservation::Confirmed { record, was_online } => {
                if was_online {
                    tracing::debug!("Node {} at {} confirmed online", id, addr);
                } else {
                    tracing::info!("Node {} at {} is back online", id, addr);
                }
                Ok(record)
            }
            NodeObservation::Adopted(record) => {
                tracing::warn!("Adopted unknown node {} at {}", id, addr);
                Ok(record)
            }
            NodeObservation::Repaired { record, removed } => {
                self.metrics.node_conflicts_total.inc();
                let conflict = Error::Conflict { id, address: addr };
                tracing::error!(
                    "{}; replaced stale rows {:?}",
                    conflict,
                    removed
                        .iter()
                        .map(|n| format!("{}@{}", n.id, n.address))
                        .collect::<Vec<_>>()
                );
                Ok(record)
            }
        }
    }

    /// Record a failed probe; unknown addresses are ignored
    pub fn mark_unreachable(&self, addr: SocketAddr, reason: &Error) -> Result<()> {
        match self.store.set_online(&addr, false)? {
            Some((true, record)) => {
                tracing::warn!("Node {} at {} went offline: {}", record.id, addr, reason);
            }
            Some((false, record)) => {
                tracing::debug!("Node {} at {} still offline: {}", record.id, addr, reason);
            }
            None => tracing::trace!("No node at {}: {}", addr, reason),
        }
        Ok(())
    }

    /// Publish the online node count
    pub fn refresh_gauge(&self) -> Result<usize> {
        let online = self.store.online_nodes()?.len();
        self.metrics.nodes_online.set(online as u64);
        Ok(online)
    }
}
