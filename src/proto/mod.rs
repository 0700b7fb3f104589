//! Wire protocol between the store client and the store server.
//!
//! Every frame is a bincode encoded enum carried in a length delimited
//! envelope. A connection starts with a `Connect` handshake; afterwards the
//! client sends `Request`s tagged with a transaction id (`xid`) and the server
//! answers with `Reply`s carrying the same id, interleaved with `Event`s for
//! fired watches.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

use crate::Error;
use crate::Result;


/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Deleted when the creating session closes or expires
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NodeCreated => "NodeCreated",
            EventType::NodeDataChanged => "NodeDataChanged",
            EventType::NodeDeleted => "NodeDeleted",
        }
    }
}

/// Notification for a fired one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoNode,
    NodeExists,
    NotEmpty,
    BadArguments,
    SessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Bumped on every content write, starts at 0
    pub version: u64,
    /// Owning session for ephemeral nodes
    pub ephemeral_owner: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Session to resume, `None` asks for a fresh one
    pub session_id: Option<u64>,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectResponse {
    Established {
        session_id: u64,
        session_timeout_ms: u64,
        resumed: bool,
    },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Create {
        path: String,
        data: Option<Vec<u8>>,
        mode: CreateMode,
    },
    GetData {
        path: String,
        watch: bool,
    },
    SetData {
        path: String,
        data: Option<Vec<u8>>,
    },
    Exists {
        path: String,
        watch: bool,
    },
    Delete {
        path: String,
    },
    Ping,
    CloseSession,
}

impl Request {
    /// Path the request targets, empty for session level requests.
    pub fn path(&self) -> &str {
        match self {
            Request::Create { path, .. }
            | Request::GetData { path, .. }
            | Request::SetData { path, .. }
            | Request::Exists { path, .. }
            | Request::Delete { path } => path,
            Request::Ping | Request::CloseSession => "",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::GetData { .. } => "get_data",
            Request::SetData { .. } => "set_data",
            Request::Exists { .. } => "exists",
            Request::Delete { .. } => "delete",
            Request::Ping => "ping",
            Request::CloseSession => "close_session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Created,
    Data { data: Option<Vec<u8>>, stat: Stat },
    Stat(Stat),
    Exists(Option<Stat>),
    Deleted,
    Pong,
    Closed,
    Error(ErrorCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Connect(ConnectRequest),
    Request { xid: u64, request: Request },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Connected(ConnectResponse),
    Reply { xid: u64, response: Response },
    Event(WatchedEvent),
}

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Bytes> {
    bincode::serialize(frame)
        .map(Bytes::from)
        .map_err(|e| Error::Protocol(format!("encode failed: {e}")))
}

pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    bincode::deserialize(buf).map_err(|e| Error::Protocol(format!("decode failed: {e}")))
}
