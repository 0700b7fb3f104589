use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Embedded store server parameters
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port 0 picks a free port, see `StoreServer::local_addr`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Interval of the session expiry scan
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Upper bound applied to client requested session timeouts
    #[serde(default = "default_max_session_timeout_ms")]
    pub max_session_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tick_ms: default_tick_ms(),
            max_session_timeout_ms: default_max_session_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Session timeout the server grants for a requested one.
    pub fn negotiate_session_timeout(
        &self,
        requested_ms: u64,
    ) -> u64 {
        requested_ms.clamp(self.tick_ms * 2, self.max_session_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(Error::InvalidConfig("server.tick_ms must be greater than 0".into()));
        }
        if self.max_session_timeout_ms < self.tick_ms * 2 {
            return Err(Error::InvalidConfig(format!(
                "server.max_session_timeout_ms ({}) must be at least twice server.tick_ms ({})",
                self.max_session_timeout_ms, self.tick_ms
            )));
        }
        if self.tick_ms > 1000 {
            warn!(
                "server.tick_ms ({}) is large; sessions may outlive their timeout by up to one tick",
                self.tick_ms
            );
        }
        Ok(())
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:0".to_string()
}
fn default_tick_ms() -> u64 {
    100
}
fn default_max_session_timeout_ms() -> u64 {
    60_000
}
