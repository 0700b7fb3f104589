use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Delivery parameters for session and content notifications
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Capacity of the session state broadcast channel
    ///
    /// Subscribers that fall further behind than this miss transitions and
    /// are told they lagged; the recovery handler treats a lag as a
    /// reconnection and resynchronizes every watcher.
    ///
    /// **Default**: 64
    #[serde(default = "default_session_event_buffer")]
    pub session_event_buffer: usize,

    /// Re-read and re-arm every content watcher after the session is
    /// resumed or replaced
    ///
    /// **Default**: true
    #[serde(default = "default_resync_on_reconnect")]
    pub resync_on_reconnect: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            session_event_buffer: default_session_event_buffer(),
            resync_on_reconnect: default_resync_on_reconnect(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_event_buffer == 0 {
            return Err(Error::InvalidConfig(
                "watch.session_event_buffer must be greater than 0".into(),
            ));
        }
        if !self.resync_on_reconnect {
            warn!("watch.resync_on_reconnect is disabled; watchers may go stale after a reconnection");
        }
        Ok(())
    }
}

const fn default_session_event_buffer() -> usize {
    64
}
const fn default_resync_on_reconnect() -> bool {
    true
}
