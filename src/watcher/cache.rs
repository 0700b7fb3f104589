//! Cached value and lifecycle state of one content watcher.
//!
//! Both live in a single `watch` channel so that every read, write and
//! wake-up happens under the channel's lock: an update racing with `stop`
//! either lands before the stop or is discarded, never after.

use tokio::sync::watch;

use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherState {
    Created,
    Started,
    Stopped,
}

impl WatcherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherState::Created => "Created",
            WatcherState::Started => "Started",
            WatcherState::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for WatcherState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the watcher currently knows about its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue<T> {
    /// Node not observed to exist
    Absent,
    /// Node exists; `None` when it holds no content
    Present(Option<T>),
}

impl<T> CachedValue<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, CachedValue::Present(_))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Snapshot<T> {
    pub(crate) state: WatcherState,
    pub(crate) value: CachedValue<T>,
}

pub(crate) struct ContentCell<T> {
    inner: watch::Sender<Snapshot<T>>,
}

impl<T: Clone> ContentCell<T> {
    pub(crate) fn new() -> Self {
        let (inner, _) = watch::channel(Snapshot {
            state: WatcherState::Created,
            value: CachedValue::Absent,
        });
        Self { inner }
    }

    pub(crate) fn state(&self) -> WatcherState {
        self.inner.borrow().state
    }

    pub(crate) fn value(&self) -> CachedValue<T> {
        self.inner.borrow().value.clone()
    }

    /// Created -> Started.
    pub(crate) fn mark_started(&self) -> Result<()> {
        let mut actual = WatcherState::Created;
        let changed = self.inner.send_if_modified(|snapshot| {
            actual = snapshot.state;
            if snapshot.state == WatcherState::Created {
                snapshot.state = WatcherState::Started;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(Error::InvalidLifecycle {
                expected: WatcherState::Created.as_str(),
                actual: actual.as_str(),
            })
        }
    }

    /// Moves to Stopped and wakes every waiter. Returns the previous state.
    pub(crate) fn mark_stopped(&self) -> WatcherState {
        let mut previous = WatcherState::Stopped;
        self.inner.send_if_modified(|snapshot| {
            previous = snapshot.state;
            snapshot.state = WatcherState::Stopped;
            previous != WatcherState::Stopped
        });
        previous
    }

    /// Replaces the cached value while the watcher is started. Returns
    /// whether the update was applied.
    pub(crate) fn update(
        &self,
        value: CachedValue<T>,
    ) -> bool {
        self.inner.send_if_modified(|snapshot| {
            if snapshot.state != WatcherState::Started {
                return false;
            }
            snapshot.value = value;
            true
        })
    }

    /// Waits until a value is present or the watcher stops.
    ///
    /// After a stop the last known value is still handed out; with nothing
    /// ever observed the wait ends in `WatcherStopped`.
    pub(crate) async fn wait_present(&self) -> Result<Option<T>> {
        let mut receiver = self.inner.subscribe();
        let value = {
            let snapshot = receiver
                .wait_for(|s| s.value.is_present() || s.state == WatcherState::Stopped)
                .await
                .map_err(|_| Error::WatcherStopped)?;
            snapshot.value.clone()
        };
        match value {
            CachedValue::Present(value) => Ok(value),
            CachedValue::Absent => Err(Error::WatcherStopped),
        }
    }
}
