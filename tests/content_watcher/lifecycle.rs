use std::sync::Arc;
use std::time::Duration;

use coord_watch::CreateMode;
use coord_watch::Error;
use coord_watch::StringCodec;
use coord_watch::WatcherState;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::eventually;
use crate::common::path;
use crate::common::Cluster;
use crate::common::SETTLE;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_does_not_hang() {
    let cluster = Cluster::start(5000).await;
    let node = path("/never");

    let watcher = Arc::new(cluster.watcher(&node));
    watcher.start().await.unwrap();

    let waiter = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.get_content().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(1), async { watcher.stop() })
        .await
        .expect("stop returns promptly");
    let released = timeout(Duration::from_secs(1), waiter).await.expect("waiter released");
    assert!(matches!(released.unwrap(), Err(Error::WatcherStopped)));
    assert_eq!(watcher.state(), WatcherState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_start_stop_does_not_leak_listeners() {
    let cluster = Cluster::start(5000).await;
    let node = path("/cycled");
    cluster
        .writer
        .create_value(&node, &StringCodec, Some(&"v0".to_string()), CreateMode::Persistent)
        .await
        .unwrap();

    let mut stopped = Vec::new();
    for _ in 0..10 {
        let watcher = cluster.watcher(&node);
        watcher.start().await.unwrap();
        assert_eq!(watcher.get_content().await.unwrap(), Some("v0".to_string()));
        watcher.stop();
        stopped.push(watcher);
    }
    assert_eq!(cluster.watching.listener_count(&node), 0);

    let live = cluster.watcher(&node);
    live.start().await.unwrap();
    assert_eq!(cluster.watching.listener_count(&node), 1);

    cluster
        .writer
        .write_value(&node, &StringCodec, Some(&"v1".to_string()))
        .await
        .unwrap();
    assert!(eventually(SETTLE, || live.try_content() == Some(Some("v1".to_string()))).await);

    // Stopped instances keep their last value and never see the write
    for watcher in &stopped {
        assert_eq!(watcher.try_content(), Some(Some("v0".to_string())));
    }
    live.stop();
    assert_eq!(cluster.watching.listener_count(&node), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_many_watchers_share_one_client() {
    let cluster = Cluster::start(5000).await;
    let nodes: Vec<_> = (0..5).map(|i| path(&format!("/shared-{i}"))).collect();
    let watchers: Vec<_> = nodes.iter().map(|node| cluster.watcher(node)).collect();
    for watcher in &watchers {
        watcher.start().await.unwrap();
    }

    for (i, node) in nodes.iter().enumerate() {
        cluster
            .writer
            .create_value(node, &StringCodec, Some(&format!("value-{i}")), CreateMode::Persistent)
            .await
            .unwrap();
    }

    for (i, watcher) in watchers.iter().enumerate() {
        let content = timeout(SETTLE, watcher.get_content()).await.unwrap();
        assert_eq!(content.unwrap(), Some(format!("value-{i}")));
    }
    assert_eq!(cluster.watching.watched_path_count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocked_wait_can_be_interrupted() {
    let cluster = Cluster::start(5000).await;
    let watcher = cluster.watcher(&path("/interrupted"));
    watcher.start().await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    assert!(matches!(watcher.content_or_cancel(&token).await, Err(Error::Interrupted)));
    assert!(matches!(
        watcher.content_timeout(Duration::from_millis(50)).await,
        Err(Error::WaitTimeout(_))
    ));
    watcher.stop();
}
