use std::time::Duration;

use coord_watch::CreateMode;
use coord_watch::StringCodec;
use tokio::time::timeout;

use crate::common::eventually;
use crate::common::path;
use crate::common::Cluster;
use crate::common::SETTLE;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_content_follows_writes() {
    let cluster = Cluster::start(5000).await;
    let node = path("/content");
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"a".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    // Pre-existing content is available without waiting for any event
    assert_eq!(watcher.try_content(), Some(Some("a".to_string())));
    assert_eq!(watcher.get_content().await.unwrap(), Some("a".to_string()));

    cluster
        .writer
        .write_value(&node, &StringCodec, Some(&"b".to_string()))
        .await
        .unwrap();
    assert!(eventually(SETTLE, || watcher.try_content() == Some(Some("b".to_string()))).await);

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_content_waits_until_node_is_created() {
    let cluster = Cluster::start(5000).await;
    let node = path("/late");

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    assert_eq!(watcher.try_content(), None);

    let writer = cluster.writer.clone();
    let creator_node = node.clone();
    let creator = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer
            .create_value(&creator_node, &StringCodec, Some(&"aaa".to_string()), CreateMode::Persistent)
            .await
    });

    let content = timeout(SETTLE, watcher.get_content()).await.expect("unblocked in time");
    assert_eq!(content.unwrap(), Some("aaa".to_string()));
    creator.await.unwrap().unwrap();

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_null_content_returns_immediately() {
    let cluster = Cluster::start(5000).await;
    let node = path("/null");
    cluster.writer.create_node(&node, None, CreateMode::Persistent).await.unwrap();

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();

    let content = timeout(Duration::from_millis(200), watcher.get_content())
        .await
        .expect("present-but-null must not block");
    assert_eq!(content.unwrap(), None);

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_of_writes_settles_on_last_value() {
    let cluster = Cluster::start(5000).await;
    let node = path("/burst");
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"0".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();

    let written: Vec<String> = (0..=20).map(|i| i.to_string()).collect();
    let writer = cluster.writer.clone();
    let to_write = written.clone();
    let write_node = node.clone();
    let writes = tokio::spawn(async move {
        for value in to_write.iter().skip(1) {
            writer.write_value(&write_node, &StringCodec, Some(value)).await.unwrap();
        }
    });

    // Every value ever observed is one that was actually written
    let mut observed = Vec::new();
    let settled = eventually(SETTLE, || {
        let current = watcher.try_content();
        if let Some(Some(value)) = &current {
            observed.push(value.clone());
        }
        current == Some(Some("20".to_string()))
    })
    .await;
    writes.await.unwrap();

    assert!(settled, "last write never observed");
    assert!(observed.iter().all(|value| written.contains(value)), "fabricated value in {observed:?}");

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_node_blocks_again_until_recreated() {
    let cluster = Cluster::start(5000).await;
    let node = path("/deleted");
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"first".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    assert_eq!(watcher.get_content().await.unwrap(), Some("first".to_string()));

    cluster.writer.delete_node(&node).await.unwrap();
    assert!(eventually(SETTLE, || watcher.try_content().is_none()).await);

    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"second".to_string()), CreateMode::Persistent)
        .await
        .unwrap();
    let content = timeout(SETTLE, watcher.get_content()).await.unwrap();
    assert_eq!(content.unwrap(), Some("second".to_string()));

    watcher.stop();
}
