//! Loopback cluster harness shared by the integration tests

#![allow(dead_code)]

use rfs::common::{CoordinatorConfig, DiscoveryConfig, VolumeConfig};
use rfs::coordinator::MetadataStore;
use rfs::volume::BlobStore;
use rfs::{Client, Coordinator, VolumeServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const REFRESH: Duration = Duration::from_millis(50);

pub struct Node {
    pub addr: SocketAddr,
    pub data_path: PathBuf,
    pub store: Arc<BlobStore>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Node {
    async fn start(addr: SocketAddr, data_path: PathBuf) -> Self {
        let server = VolumeServer::bind(VolumeConfig {
            bind_addr: addr,
            data_path: data_path.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let store = server.store();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            server
                .serve_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            data_path,
            store,
            stop: Some(tx),
            task: Some(task),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }

    /// Start again on the same address and data directory
    pub async fn restart(&mut self) {
        self.stop().await;
        *self = Node::start(self.addr, self.data_path.clone()).await;
    }
}

pub struct Cluster {
    pub nodes: Vec<Node>,
    pub master: SocketAddr,
    pub store: Arc<MetadataStore>,
    pub replicas: usize,
    master_stop: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl Cluster {
    pub async fn start(node_count: usize, replicas: usize) -> Self {
        let dir = TempDir::new().unwrap();

        let mut nodes = Vec::with_capacity(node_count);
        for i in 0..node_count {
            let data_path = dir.path().join(format!("node-{}", i));
            nodes.push(Node::start("127.0.0.1:0".parse().unwrap(), data_path).await);
        }

        let coord = Coordinator::bind(CoordinatorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            admin_addr: None,
            db_path: dir.path().join("master"),
            replicas,
            refresh_interval_ms: REFRESH.as_millis() as u64,
            node_timeout_ms: 300,
            discovery: DiscoveryConfig::Static {
                nodes: nodes.iter().map(|n| n.addr).collect(),
            },
            ..Default::default()
        })
        .await
        .unwrap();
        let master = coord.local_addr().unwrap();
        let store = coord.store();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            coord
                .serve_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        let cluster = Self {
            nodes,
            master,
            store,
            replicas,
            master_stop: Some(tx),
            _dir: dir,
        };
        let expected = node_count;
        cluster
            .wait_until("all nodes online", |c| c.online_count() == expected)
            .await;
        cluster
    }

    pub fn client(&self) -> Client {
        Client::new(self.master)
            .with_replicas(self.replicas)
            .with_timeout(Duration::from_secs(5))
    }

    pub fn online_count(&self) -> usize {
        self.store.online_nodes().unwrap().len()
    }

    /// Node whose address is `addr`
    pub fn node_index(&self, addr: &SocketAddr) -> usize {
        self.nodes.iter().position(|n| n.addr == *addr).unwrap()
    }

    /// Poll `cond` until it holds, panicking after a few seconds
    pub async fn wait_until<F>(&self, what: &str, cond: F)
    where
        F: Fn(&Self) -> bool,
    {
        for _ in 0..250 {
            if cond(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(tx) = self.master_stop.take() {
            let _ = tx.send(());
        }
        for node in &mut self.nodes {
            if let Some(tx) = node.stop.take() {
                let _ = tx.send(());
            }
        }
    }
}
