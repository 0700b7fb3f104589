use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Session and request parameters of the store client
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// `host:port` of the store (or of a gateway in front of it)
    #[serde(default = "default_connect_string")]
    pub connect_string: String,

    /// Requested session timeout. The store keeps the session, its
    /// ephemeral nodes and its identity alive this long without a connection.
    /// Default: 5000ms
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Bound on a single TCP connect plus handshake attempt
    /// Default: 1000ms
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on a single request round trip once sent
    /// Default: 3000ms
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Total time an operation keeps waiting for a usable session and
    /// retrying after connection loss before giving up
    /// Default: 30000ms
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_string: default_connect_string(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Default::default()
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_string.trim().is_empty() {
            return Err(Error::InvalidConfig("client.connect_string must not be empty".into()));
        }
        if !self.connect_string.contains(':') {
            return Err(Error::InvalidConfig(format!(
                "client.connect_string {:?} must be host:port",
                self.connect_string
            )));
        }
        if self.session_timeout_ms == 0 {
            return Err(Error::InvalidConfig("client.session_timeout_ms must be greater than 0".into()));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "client.connect_timeout_ms and client.request_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.operation_timeout_ms < self.connect_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "client.operation_timeout_ms ({}) must not be shorter than client.connect_timeout_ms ({})",
                self.operation_timeout_ms, self.connect_timeout_ms
            )));
        }
        Ok(())
    }
}

fn default_connect_string() -> String {
    "127.0.0.1:2181".to_string()
}
fn default_session_timeout_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    3000
}
fn default_operation_timeout_ms() -> u64 {
    30_000
}
