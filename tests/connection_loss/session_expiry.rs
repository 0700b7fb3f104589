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
async fn test_watcher_survives_forced_session_expiry() {
    let cluster = Cluster::start(5000).await;
    let node = path("/expiring");
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"v1".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    let old_session = cluster.watching.session_id().unwrap();

    assert!(cluster.server.expire_session(old_session));
    assert!(
        eventually(SETTLE, || {
            cluster.watching.session_state() == SessionState::Connected
                && cluster.watching.session_id().is_some_and(|id| id != old_session)
        })
        .await
    );

    cluster
        .writer
        .write_value(&node, &StringCodec, Some(&"v2".to_string()))
        .await
        .unwrap();
    assert!(eventually(SETTLE, || watcher.try_content() == Some(Some("v2".to_string()))).await);

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partition_longer_than_session_timeout() {
    let cluster = Cluster::start(300).await;
    let node = path("/long-outage");
    let watcher = cluster.watcher(&node);
    watcher.start().await.unwrap();
    let mut transitions = cluster.watching.subscribe_session_state();

    cluster.gateway.stop();
    tokio::time::sleep(Duration::from_millis(800)).await;
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"aaa".to_string()), CreateMode::Persistent)
        .await
        .unwrap();
    cluster.gateway.start();

    let mut seen = Vec::new();
    while !seen.contains(&SessionState::Connected) {
        let state = timeout(SETTLE, transitions.recv()).await.unwrap().unwrap();
        seen.push(state);
    }
    assert!(seen.contains(&SessionState::Expired), "saw {seen:?}");

    let content = timeout(SETTLE, watcher.get_content()).await.unwrap();
    assert_eq!(content.unwrap(), Some("aaa".to_string()));

    watcher.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expiry_removes_ephemeral_node_and_watcher_sees_it() {
    let cluster = Cluster::start(5000).await;
    let node = path("/owned");
    cluster
        .watching
        .create_value(&node, &StringCodec, Some(&"mine".to_string()), CreateMode::Ephemeral)
        .await
        .unwrap();

    let observer = crate::common::connect(cluster.server.connect_string(), 5000).await;
    let watcher = coord_watch::ContentWatcher::new(std::sync::Arc::new(observer), node.clone(), StringCodec);
    watcher.start().await.unwrap();
    assert_eq!(watcher.get_content().await.unwrap(), Some("mine".to_string()));

    let session = cluster.watching.session_id().unwrap();
    assert!(cluster.server.expire_session(session));

    assert!(eventually(SETTLE, || watcher.try_content().is_none()).await);
    watcher.stop();
}
