use std::fmt;
use std::time::Duration;

/// Connection-level state of a store client's session.
///
/// `Reconnected` means the transport came back and the server resumed the
/// same session; `Connected` after `Expired` means a brand new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
    Reconnected,
    Closed,
}

impl SessionState {
    /// Requests can be sent in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Reconnected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connected => "Connected",
            SessionState::Disconnected => "Disconnected",
            SessionState::Expired => "Expired",
            SessionState::Reconnected => "Reconnected",
            SessionState::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the session the server granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u64,
    /// Timeout negotiated by the server
    pub timeout: Duration,
}
