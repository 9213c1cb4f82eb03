//! Delete semantics and background reclamation

mod common;

use common::Cluster;
use rfs::Error;

#[tokio::test]
async fn test_delete_is_idempotent() {
    let mut cluster = Cluster::start(1, 1).await;
    let client = cluster.client();
    client.upload("/tmp/a", b"contents").await.unwrap();

    // With its only node offline the file cannot be purged between deletes
    cluster.nodes[0].stop().await;
    cluster
        .wait_until("node offline", |c| c.online_count() == 0)
        .await;

    client.delete("/tmp/a").await.unwrap();
    client.delete("/tmp/a").await.unwrap();
    assert!(cluster.store.get_file("/tmp/a").unwrap().unwrap().deleted);

    let err = client.download("/tmp/a").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // Once the node is back the file is reclaimed and then unknown
    cluster.nodes[0].restart().await;
    cluster
        .wait_until("file purged", |c| {
            c.store.get_file("/tmp/a").unwrap().is_none()
        })
        .await;
    let err = client.delete("/tmp/a").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_delete_missing_path() {
    let cluster = Cluster::start(1, 1).await;
    let err = cluster.client().delete("/never").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(p) if p == "/never"));
}

#[tokio::test]
async fn test_deleted_file_is_reclaimed() {
    let cluster = Cluster::start(3, 3).await;
    let client = cluster.client();
    let data = vec![9u8; 50_000];
    client.upload("/big", &data).await.unwrap();

    let chunks = cluster.store.get_file("/big").unwrap().unwrap().unique_chunks();
    assert!(!chunks.is_empty());
    assert!(chunks
        .iter()
        .all(|id| cluster.nodes.iter().all(|n| n.store.contains(id))));

    client.delete("/big").await.unwrap();

    cluster
        .wait_until("file purged", |c| {
            c.store.get_file("/big").unwrap().is_none()
                && chunks.iter().all(|id| {
                    c.store.get_chunk(id).unwrap().is_none()
                        && c.nodes.iter().all(|n| !n.store.contains(id))
                })
        })
        .await;
}

#[tokio::test]
async fn test_shared_chunk_survives_delete_of_one_file() {
    let cluster = Cluster::start(2, 2).await;
    let client = cluster.client();
    let data = vec![1u8; 8192];
    client.upload("/one", &data).await.unwrap();
    client.upload("/two", &data).await.unwrap();

    client.delete("/one").await.unwrap();
    cluster
        .wait_until("first file purged", |c| {
            c.store.get_file("/one").unwrap().is_none()
        })
        .await;

    assert_eq!(client.download("/two").await.unwrap(), data);
}
