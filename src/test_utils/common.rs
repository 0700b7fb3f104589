use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::ClientConfig;
use crate::RetryPolicies;
use crate::ServerConfig;
use crate::StoreClient;
use crate::StoreServer;
use crate::WatchConfig;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn test_server_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        tick_ms: 20,
        max_session_timeout_ms: 10_000,
    }
}

pub fn test_client_config(connect_string: impl Into<String>) -> ClientConfig {
    ClientConfig {
        connect_string: connect_string.into(),
        session_timeout_ms: 5000,
        connect_timeout_ms: 500,
        request_timeout_ms: 2000,
        operation_timeout_ms: 5000,
    }
}

pub fn fast_retry() -> RetryPolicies {
    let mut retry = RetryPolicies::default();
    retry.reconnect.base_delay_ms = 20;
    retry.reconnect.max_delay_ms = 200;
    retry
}

pub async fn start_server() -> StoreServer {
    StoreServer::start(test_server_config()).await.expect("server starts")
}

pub async fn connect_client(connect_string: impl Into<String>) -> StoreClient {
    StoreClient::connect(test_client_config(connect_string), fast_retry(), WatchConfig::default())
        .await
        .expect("client connects")
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
