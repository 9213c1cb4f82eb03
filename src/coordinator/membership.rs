//! Membership prober
//!
//! Every refresh interval each candidate address is probed concurrently. A
//! reachable node feeds its reported id into the registry; an unreachable one
//! is marked offline. No probe failure is fatal to the cycle.

use crate::common::{DiscoveryConfig, Error, MetricsRegistry, Result};
use crate::coordinator::node_client::StorageNodeClient;
use crate::coordinator::registry::NodeRegistry;
use futures_util::future::join_all;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Source of candidate node addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Static(Vec<SocketAddr>),
    /// Every host of `local_ip`'s /24 except `local_ip` itself
    Subnet { local_ip: Ipv4Addr, port: u16 },
}

impl Discovery {
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        match config {
            DiscoveryConfig::Static { nodes } => Ok(Discovery::Static(nodes.clone())),
            DiscoveryConfig::Subnet { local_ip, port } => {
                let local_ip = match local_ip {
                    Some(ip) => *ip,
                    None => detect_local_ipv4()?,
                };
                Ok(Discovery::Subnet {
                    local_ip,
                    port: *port,
                })
            }
        }
    }

    pub fn candidates(&self) -> Vec<SocketAddr> {
        match self {
            Discovery::Static(nodes) => nodes.clone(),
            Discovery::Subnet { local_ip, port } => {
                let [a, b, c, own] = local_ip.octets();
                (1..=254u8)
                    .filter(|host| *host != own)
                    .map(|host| SocketAddr::from(([a, b, c, host], *port)))
                    .collect()
            }
        }
    }
}

/// Address of the interface holding the default route
///
/// Connecting a UDP socket sends nothing; it only selects the source address.
fn detect_local_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    match socket.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(Error::InvalidConfig(format!(
            "cannot derive a /24 subnet from local address {}",
            other
        ))),
    }
}

/// Outcome counts of one probe cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probed: usize,
    pub reachable: usize,
    pub online: usize,
}

pub struct MembershipProber {
    registry: Arc<NodeRegistry>,
    client: StorageNodeClient,
    discovery: Discovery,
    metrics: Arc<MetricsRegistry>,
}

impl MembershipProber {
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: StorageNodeClient,
        discovery: Discovery,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            client,
            discovery,
            metrics,
        }
    }

    /// Probe every candidate once
    pub async fn run_cycle(&self) -> ProbeSummary {
        let candidates = self.discovery.candidates();
        let results = join_all(candidates.iter().map(|addr| self.probe_one(*addr))).await;

        let online = match self.registry.refresh_gauge() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Failed to count online nodes: {}", e);
                0
            }
        };

        ProbeSummary {
            probed: candidates.len(),
            reachable: results.into_iter().filter(|ok| *ok).count(),
            online,
        }
    }

    async fn probe_one(&self, addr: SocketAddr) -> bool {
        self.metrics.probes_total.inc();

        let outcome = match self.client.probe(addr).await {
            Ok(session) => self.registry.handle_probe(session).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => true,
            Err(e) => {
                self.metrics.probe_failures_total.inc();
                if let Err(store_err) = self.registry.mark_unreachable(addr, &e) {
                    tracing::error!("Failed to mark {} offline: {}", addr, store_err);
                }
                false
            }
        }
    }
}

/// Spawn the periodic membership loop
pub fn start_membership_task(
    prober: Arc<MembershipProber>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = prober.run_cycle().await;
                    tracing::debug!(
                        "Probe cycle: {} candidates, {} reachable, {} online",
                        summary.probed,
                        summary.reachable,
                        summary.online
                    );
                }
                _ = shutdown.changed() => {
                    tracing::info!("Membership prober stopped");
                    break;
                }
            }
        }
    })
}
