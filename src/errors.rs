//! Error hierarchy for the content watching client layer.
//!
//! Store level faults (missing nodes, lost connections, expired sessions) are
//! modelled next to the caller directed conditions (interruption, stop) so the
//! watcher can decide which ones to absorb and which ones to surface.

use std::time::Duration;

use config::ConfigError;

use crate::proto::ErrorCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Node absent when a read, write or delete was attempted
    #[error("Node not found: {path}")]
    NodeNotFound { path: String },

    /// Node already present when a create was attempted
    #[error("Node already exists: {path}")]
    NodeExists { path: String },

    /// Node still has children and cannot be deleted
    #[error("Node has children: {path}")]
    NotEmpty { path: String },

    /// Transport to the store dropped while the request was in flight
    #[error("Connection to the store was lost")]
    ConnectionLoss,

    /// The store no longer knows our session
    #[error("Session expired")]
    SessionExpired,

    /// Retry-until-connected gave up
    #[error("Operation did not complete within {0:?}")]
    OperationTimeout(Duration),

    /// A blocked content wait was cancelled by its caller
    #[error("Wait for content was interrupted")]
    Interrupted,

    /// A bounded content wait elapsed before any value was observed
    #[error("No content observed within {0:?}")]
    WaitTimeout(Duration),

    /// The watcher was stopped before any value was observed
    #[error("Content watcher has been stopped")]
    WatcherStopped,

    #[error("Operation requires {expected} state but watcher is {actual}")]
    InvalidLifecycle {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid node path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Peer sent a frame that does not fit the conversation
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Store client is closed")]
    ClientClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error("Content is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl Error {
    /// Faults the client retries on its own once the session is back.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectionLoss | Error::OperationTimeout(_) | Error::SessionExpired)
    }

    pub fn is_node_not_found(&self) -> bool {
        matches!(self, Error::NodeNotFound { .. })
    }

    /// Translates a store reply code into the client error for `path`.
    pub(crate) fn from_code(
        code: ErrorCode,
        path: &str,
    ) -> Self {
        match code {
            ErrorCode::NoNode => Error::NodeNotFound { path: path.to_string() },
            ErrorCode::NodeExists => Error::NodeExists { path: path.to_string() },
            ErrorCode::NotEmpty => Error::NotEmpty { path: path.to_string() },
            ErrorCode::BadArguments => Error::InvalidPath(path.to_string()),
            ErrorCode::SessionExpired => Error::SessionExpired,
        }
    }
}
