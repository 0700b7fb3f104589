use std::sync::Arc;
use std::time::Duration;

use coord_watch::ClientConfig;
use coord_watch::ContentWatcher;
use coord_watch::Gateway;
use coord_watch::NodePath;
use coord_watch::RetryPolicies;
use coord_watch::ServerConfig;
use coord_watch::StoreClient;
use coord_watch::StoreServer;
use coord_watch::StringCodec;
use coord_watch::WatchConfig;
use tracing_subscriber::EnvFilter;

// Generous bound for anything that should happen "soon"
pub const SETTLE: Duration = Duration::from_secs(10);

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        tick_ms: 20,
        max_session_timeout_ms: 30_000,
    }
}

pub fn client_config(
    connect_string: impl Into<String>,
    session_timeout_ms: u64,
) -> ClientConfig {
    ClientConfig {
        connect_string: connect_string.into(),
        session_timeout_ms,
        connect_timeout_ms: 500,
        request_timeout_ms: 2000,
        operation_timeout_ms: 10_000,
    }
}

pub fn fast_retry() -> RetryPolicies {
    let mut retry = RetryPolicies::default();
    retry.reconnect.base_delay_ms = 20;
    retry.reconnect.max_delay_ms = 200;
    retry
}

pub async fn connect(
    connect_string: impl Into<String>,
    session_timeout_ms: u64,
) -> StoreClient {
    StoreClient::connect(client_config(connect_string, session_timeout_ms), fast_retry(), WatchConfig::default())
        .await
        .expect("client connects")
}

/// Embedded store with a gateway in front of it.
///
/// `watching` reaches the store through the gateway; `writer` talks to it
/// directly so writes keep working while the gateway is stopped.
pub struct Cluster {
    pub server: StoreServer,
    pub gateway: Gateway,
    pub watching: StoreClient,
    pub writer: StoreClient,
}

impl Cluster {
    pub async fn start(session_timeout_ms: u64) -> Self {
        enable_logger();
        let server = StoreServer::start(server_config()).await.expect("server starts");
        let gateway = Gateway::bind("127.0.0.1:0", server.local_addr()).await.expect("gateway binds");
        gateway.start();
        let watching = connect(gateway.connect_string(), session_timeout_ms).await;
        let writer = connect(server.connect_string(), 30_000).await;
        Self {
            server,
            gateway,
            watching,
            writer,
        }
    }

    pub fn watcher(
        &self,
        path: &NodePath,
    ) -> ContentWatcher<StringCodec> {
        ContentWatcher::new(Arc::new(self.watching.clone()), path.clone(), StringCodec)
    }
}

pub fn path(raw: &str) -> NodePath {
    NodePath::new(raw).expect("valid path")
}

/// Polls `probe` until it returns `true` or `limit` elapses.
pub async fn eventually<F>(
    limit: Duration,
    mut probe: F,
) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    probe()
}
