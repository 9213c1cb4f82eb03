//! Replica failover and node restarts

mod common;

use common::Cluster;
use rfs::common::protocol::Status;
use rfs::Error;

#[tokio::test]
async fn test_retrieval_fails_over_to_next_replica() {
    // 3 nodes at 2 replicas: one chunk stored twice
    let mut cluster = Cluster::start(3, 2).await;
    let client = cluster.client();
    let data = vec![42u8; 10_000];
    client.upload("/replicated", &data).await.unwrap();

    let file = cluster.store.get_file("/replicated").unwrap().unwrap();
    assert_eq!(file.chunk_order.len(), 1);
    let holders: Vec<_> = cluster
        .store
        .placements(&file.chunk_order[0])
        .unwrap()
        .into_iter()
        .map(|p| p.node.unwrap().address)
        .collect();
    assert_eq!(holders.len(), 2);

    let first = cluster.node_index(&holders[0]);
    cluster.nodes[first].stop().await;
    cluster
        .wait_until("first holder offline", |c| c.online_count() == 2)
        .await;
    assert_eq!(client.download("/replicated").await.unwrap(), data);

    let second = cluster.node_index(&holders[1]);
    cluster.nodes[second].stop().await;
    cluster
        .wait_until("second holder offline", |c| c.online_count() == 1)
        .await;
    let err = client.download("/replicated").await.unwrap_err();
    assert!(matches!(err, Error::Remote(Status::ChunkUnavailable)));
}

#[tokio::test]
async fn test_restarted_node_keeps_its_id() {
    let mut cluster = Cluster::start(1, 1).await;
    let nodes = cluster.store.list_nodes().unwrap();
    assert_eq!(nodes.len(), 1);
    let id = nodes[0].id;
    assert_eq!(cluster.nodes[0].store.node_id(), id);

    cluster.nodes[0].stop().await;
    cluster
        .wait_until("node offline", |c| c.online_count() == 0)
        .await;

    cluster.nodes[0].restart().await;
    cluster
        .wait_until("node back online", |c| c.online_count() == 1)
        .await;

    let nodes = cluster.store.list_nodes().unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].id, id);
    assert_eq!(cluster.nodes[0].store.node_id(), id);

    let client = cluster.client();
    client.upload("/after-restart", b"still here").await.unwrap();
    assert_eq!(
        client.download("/after-restart").await.unwrap(),
        b"still here"
    );
}

#[tokio::test]
async fn test_upload_skips_offline_nodes() {
    let mut cluster = Cluster::start(3, 3).await;
    let offline = cluster.nodes[2].addr;
    cluster.nodes[2].stop().await;
    cluster
        .wait_until("node offline", |c| c.online_count() == 2)
        .await;

    let client = cluster.client();
    let report = client.upload("/two-of-three", &[5u8; 2048]).await.unwrap();
    assert_eq!(report.achieved_replicas, 2);

    let file = cluster.store.get_file("/two-of-three").unwrap().unwrap();
    for placement in cluster.store.placements(&file.chunk_order[0]).unwrap() {
        assert_ne!(placement.node.unwrap().address, offline);
    }
}
