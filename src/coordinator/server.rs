//! Coordinator server

use crate::common::{CoordinatorConfig, MetricsRegistry, Result};
use crate::coordinator::gc::{start_gc_task, GarbageCollector};
use crate::coordinator::handler::{ConnectionHandler, HandlerContext};
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::membership::{start_membership_task, Discovery, MembershipProber};
use crate::coordinator::metadata::MetadataStore;
use crate::coordinator::node_client::StorageNodeClient;
use crate::coordinator::placement::PlacementPolicy;
use crate::coordinator::registry::NodeRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

pub struct Coordinator {
    config: CoordinatorConfig,
    listener: TcpListener,
    store: Arc<MetadataStore>,
    metrics: Arc<MetricsRegistry>,
}

impl Coordinator {
    /// Open the metadata store and bind the client-facing listener
    pub async fn bind(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MetadataStore::open(
            &config.db_path,
            std::time::Duration::from_millis(config.lock_timeout_ms),
        )?);
        let listener = TcpListener::bind(config.bind_addr).await?;

        Ok(Self {
            config,
            listener,
            store,
            metrics: Arc::new(MetricsRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn store(&self) -> Arc<MetadataStore> {
        self.store.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// Serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        self.serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;
        let discovery = Discovery::from_config(&config.discovery)?;

        tracing::info!("Starting rfs master");
        tracing::info!("  Client API: {}", self.local_addr()?);
        tracing::info!("  DB path: {}", config.db_path.display());
        tracing::info!("  Replicas: {}", config.replicas);
        tracing::info!("  Refresh: {:?}", config.refresh_interval());
        match &discovery {
            Discovery::Static(nodes) => tracing::info!("  Discovery: {} static nodes", nodes.len()),
            Discovery::Subnet { local_ip, port } => {
                tracing::info!("  Discovery: {}/24 on port {}", local_ip, port)
            }
        }

        let node_client = StorageNodeClient::new(config.node_timeout())
            .with_max_frame_len(config.max_frame_len);
        let registry = Arc::new(NodeRegistry::new(self.store.clone(), self.metrics.clone()));
        let prober = Arc::new(MembershipProber::new(
            registry,
            node_client.clone(),
            discovery,
            self.metrics.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            self.store.clone(),
            node_client,
            self.metrics.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            start_membership_task(prober, config.refresh_interval(), shutdown_rx.clone()),
            start_gc_task(gc.clone(), config.refresh_interval(), shutdown_rx.clone()),
        ];

        if let Some(admin_addr) = config.admin_addr {
            let router = create_router(CoordState {
                store: self.store.clone(),
                metrics: self.metrics.clone(),
                replicas: config.replicas,
            });
            let admin_listener = TcpListener::bind(admin_addr).await?;
            tracing::info!("  Admin API: {}", admin_listener.local_addr()?);
            let mut rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let server = axum::serve(admin_listener, router).with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                });
                if let Err(e) = server.await {
                    tracing::error!("Admin HTTP server error: {}", e);
                }
            }));
        }

        let ctx = Arc::new(HandlerContext {
            store: self.store.clone(),
            policy: PlacementPolicy::new(config.replicas),
            gc,
            metrics: self.metrics.clone(),
            idle_timeout: config.idle_timeout(),
            max_frame_len: config.max_frame_len,
        });

        tracing::info!("✓ Master ready");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let span = tracing::info_span!("conn", id = %Uuid::new_v4(), %peer);
                        let ctx = ctx.clone();
                        tokio::spawn(
                            async move {
                                tracing::debug!("Accepted connection");
                                if let Err(e) = ConnectionHandler::new(stream, ctx).run().await {
                                    tracing::trace!("Connection closed with error: {}", e);
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutting down master");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}
