use std::time::Duration;

use coord_watch::CreateMode;
use coord_watch::SessionState;
use coord_watch::StringCodec;
use tokio::time::timeout;

use crate::common::eventually;
use crate::common::path;
use crate::common::Cluster;
use crate::common::SETTLE;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_recovers_after_connection_loss() {
    let cluster = Cluster::start(5000).await;
    let node = path("/partitioned");

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    let session_before = cluster.watching.session_id();

    cluster.gateway.stop();
    cluster.gateway.stop();
    tokio::time::sleep(Duration::from_millis(250)).await;
    cluster.gateway.start();

    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"aaa".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let content = timeout(SETTLE, watcher.get_content()).await.expect("recovered in time");
    assert_eq!(content.unwrap(), Some("aaa".to_string()));
    // Short outage: the same session was resumed
    assert_eq!(cluster.watching.session_id(), session_before);

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_keeps_last_known_value() {
    let cluster = Cluster::start(5000).await;
    let node = path("/stale");
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"before".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    let mut states = cluster.watching.watch_session_state();

    cluster.gateway.stop();
    timeout(SETTLE, states.wait_for(|s| *s == SessionState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    // Stale but present beats a false "absent"
    assert_eq!(watcher.try_content(), Some(Some("before".to_string())));
    assert_eq!(watcher.get_content().await.unwrap(), Some("before".to_string()));

    cluster
        .writer
        .write_value(&node, &StringCodec, Some(&"during".to_string()))
        .await
        .unwrap();
    cluster.gateway.start();

    // The change made while partitioned is picked up by the resync
    assert!(eventually(SETTLE, || watcher.try_content() == Some(Some("during".to_string()))).await);

    // And the watch is armed again afterwards
    cluster
        .writer
        .write_value(&node, &StringCodec, Some(&"after".to_string()))
        .await
        .unwrap();
    assert!(eventually(SETTLE, || watcher.try_content() == Some(Some("after".to_string()))).await);

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnection_is_reported_as_resumed_session() {
    let cluster = Cluster::start(5000).await;
    let mut transitions = cluster.watching.subscribe_session_state();

    cluster.gateway.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.gateway.start();

    let mut seen = Vec::new();
    while !seen.contains(&SessionState::Reconnected) {
        let state = timeout(SETTLE, transitions.recv()).await.unwrap().unwrap();
        seen.push(state);
    }
    assert_eq!(seen.first(), Some(&SessionState::Disconnected));
    assert!(!seen.contains(&SessionState::Expired));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operations_retry_until_connected() {
    let cluster = Cluster::start(5000).await;
    let node = path("/retried");

    cluster.gateway.stop();
    let mut states = cluster.watching.watch_session_state();
    timeout(SETTLE, states.wait_for(|s| *s == SessionState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    let client = cluster.watching.clone();
    let create_node = node.clone();
    let create = tokio::spawn(async move { client.create_node(&create_node, None, CreateMode::Persistent).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!create.is_finished());
    cluster.gateway.start();

    timeout(SETTLE, create).await.unwrap().unwrap().unwrap();
    assert!(cluster.writer.exists(&node).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_started_while_partitioned() {
    let cluster = Cluster::start(5000).await;
    let node = path("/started-offline");

    cluster.gateway.stop();
    cluster.gateway.stop();

    // Reconnect after 250ms and create the node through the same client
    let reviver = async {
        tokio::time::sleep(Duration::from_millis(250)).await;
        cluster.gateway.start();
        cluster
            .watching
            .create_value(&node, &StringCodec, Some(&"aaa".to_string()), CreateMode::Persistent)
            .await
    };

    let watcher = cluster.watcher(&node);
    let watch = async {
        watcher.start().await.unwrap();
        watcher.get_content().await
    };

    let (created, content) = timeout(SETTLE, async { tokio::join!(reviver, watch) })
        .await
        .expect("recovered in time");
    created.unwrap();
    assert_eq!(content.unwrap(), Some("aaa".to_string()));

    watcher.stop();
}
