//! Re-arms path watches after the session comes back.
//!
//! Watches live on the server side of a connection, so when the transport
//! drops they are gone even if the session itself survives. This task listens
//! for session transitions and asks every registered path listener to
//! resynchronize whenever a connection is re-established.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::listeners::ListenerRegistry;
use super::session::SessionState;
use crate::Result;

/// Decides which transitions invalidate armed watches.
#[derive(Debug, Default)]
pub(crate) struct RecoveryTracker {
    connected_once: bool,
}

impl RecoveryTracker {
    /// Returns `true` when listeners must resynchronize.
    pub(crate) fn observe(
        &mut self,
        state: SessionState,
    ) -> bool {
        match state {
            // The very first session has nothing to recover
            SessionState::Connected => std::mem::replace(&mut self.connected_once, true),
            SessionState::Reconnected => {
                self.connected_once = true;
                true
            }
            SessionState::Disconnected | SessionState::Expired | SessionState::Closed => false,
        }
    }
}

pub(crate) struct SessionRecovery {
    registry: Arc<ListenerRegistry>,
    tracker: RecoveryTracker,
}

impl SessionRecovery {
    pub(crate) fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self {
            registry,
            tracker: RecoveryTracker::default(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut transitions: broadcast::Receiver<SessionState>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = transitions.recv() => match received {
                    Ok(state) => {
                        if self.tracker.observe(state) {
                            let notified = self.registry.resync_all();
                            info!(%state, notified, "Listeners asked to resynchronize");
                        }
                        if state == SessionState::Closed {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Whatever was skipped may have been a reconnection
                        warn!(skipped, "Session transitions lagged; resynchronizing everyone");
                        self.registry.resync_all();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Session recovery stopped");
        Ok(())
    }
}
