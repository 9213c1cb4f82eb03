//! Admin HTTP API for the master
//!
//! Read-only views over the metadata store plus Prometheus metrics:
//! - `GET /health`
//! - `GET /admin/status`
//! - `GET /admin/nodes`
//! - `GET /admin/files`
//! - `GET /metrics`

use crate::common::MetricsRegistry;
use crate::coordinator::metadata::MetadataStore;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct CoordState {
    pub store: Arc<MetadataStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub replicas: usize,
}

/// Creates the admin router
pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/admin/status", axum::routing::get(admin_status))
        .route("/admin/nodes", axum::routing::get(admin_nodes))
        .route("/admin/files", axum::routing::get(admin_files))
        .route("/metrics", axum::routing::get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Cluster summary for dashboards
async fn admin_status(State(state): State<CoordState>) -> impl IntoResponse {
    match state.store.stats() {
        Ok(stats) => (
            StatusCode::OK,
            axum::Json(json!({
                "replicas": state.replicas,
                "degraded": stats.online_nodes < state.replicas,
                "uptime_seconds": state.metrics.uptime_seconds(),
                "nodes": stats.nodes,
                "online_nodes": stats.online_nodes,
                "files": stats.files,
                "deleted_files": stats.deleted_files,
                "chunks": stats.chunks,
                "placements": stats.placements,
                "orphans": stats.orphans,
            })),
        ),
        Err(e) => error_response(e),
    }
}

async fn admin_nodes(State(state): State<CoordState>) -> impl IntoResponse {
    match state.store.list_nodes() {
        Ok(nodes) => {
            let nodes: Vec<_> = nodes
                .iter()
                .map(|n| {
                    json!({
                        "id": n.id,
                        "address": n.address.to_string(),
                        "online": n.online,
                        "last_seen": n.last_seen,
                    })
                })
                .collect();
            (StatusCode::OK, axum::Json(json!({ "nodes": nodes })))
        }
        Err(e) => error_response(e),
    }
}

async fn admin_files(State(state): State<CoordState>) -> impl IntoResponse {
    match state.store.list_files() {
        Ok(files) => {
            let files: Vec<_> = files
                .iter()
                .map(|f| {
                    json!({
                        "path": f.path,
                        "chunks": f.chunk_order.iter().map(|c| c.to_hex()).collect::<Vec<_>>(),
                        "deleted": f.deleted,
                        "created_at": f.created_at,
                        "deleted_at": f.deleted_at,
                    })
                })
                .collect();
            (StatusCode::OK, axum::Json(json!({ "files": files })))
        }
        Err(e) => error_response(e),
    }
}

/// Prometheus /metrics
async fn metrics(State(state): State<CoordState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

fn error_response(e: crate::Error) -> (StatusCode, axum::Json<serde_json::Value>) {
    tracing::error!("Admin query failed: {}", e);
    (
        e.to_http_status(),
        axum::Json(json!({ "error": e.to_string() })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ChunkId;
    use crate::coordinator::placement::PlacementPolicy;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> (tempfile::TempDir, CoordState) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path(), Duration::from_millis(200)).unwrap());
        let state = CoordState {
            store,
            metrics: Arc::new(MetricsRegistry::new()),
            replicas: 3,
        };
        (dir, state)
    }

    async fn get_json(router: Router, uri: &str) -> serde_json::Value {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = state();
        let json = get_json(create_router(state), "/health").await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_admin_status_counts() {
        let (_dir, state) = state();
        state
            .store
            .observe_node("10.0.0.1:5900".parse().unwrap(), 1)
            .unwrap();
        let plan = PlacementPolicy::new(3)
            .place(&[ChunkId::of(b"a")], &state.store.online_nodes().unwrap())
            .unwrap();
        state.store.commit_upload("/a", &plan).unwrap();

        let json = get_json(create_router(state), "/admin/status").await;
        assert_eq!(json["nodes"], 1);
        assert_eq!(json["online_nodes"], 1);
        assert_eq!(json["files"], 1);
        assert_eq!(json["chunks"], 1);
        assert_eq!(json["degraded"], true);
    }

    #[tokio::test]
    async fn test_admin_nodes_and_files() {
        let (_dir, state) = state();
        state
            .store
            .observe_node("10.0.0.7:5900".parse().unwrap(), 7)
            .unwrap();
        let router = create_router(state);

        let json = get_json(router.clone(), "/admin/nodes").await;
        assert_eq!(json["nodes"][0]["id"], 7);
        assert_eq!(json["nodes"][0]["address"], "10.0.0.7:5900");

        let json = get_json(router, "/admin/files").await;
        assert!(json["files"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let (_dir, state) = state();
        state.metrics.uploads_total.inc();
        let resp = create_router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("rfs_uploads_total 1"));
    }
}
