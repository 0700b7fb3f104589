//! Content watcher: a locally cached, always current copy of one node.
//!
//! The watcher drains the per-path event channel of its client in a single
//! task, so events for its node are applied one at a time and in delivery
//! order. Every event, including the resync requests sent after the session
//! comes back, is handled the same way: re-arm the watch, re-read, update the
//! cache.
//!
//! Policies:
//! - A node stored without content is cached as present-but-null.
//! - A deleted node makes the cache absent; `get_content` blocks again until
//!   the node is re-created.
//! - A read that races with a deletion keeps the previous value; the
//!   deletion event that follows settles it.
//! - Transient store faults never reach `get_content` callers.
//! - After `stop`, callers get the last known value, or `WatcherStopped`
//!   when nothing was ever observed.

mod cache;


use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

pub use self::cache::CachedValue;
use self::cache::ContentCell;
pub use self::cache::WatcherState;
use crate::metrics::CONTENT_UPDATES;
use crate::utils::async_task::spawn_task;
use crate::utils::backoff::Backoff;
use crate::BackoffPolicy;
use crate::CoordinationClient;
use crate::Error;
use crate::NodePath;
use crate::PathEvent;
use crate::Result;
use crate::RetryPolicies;
use crate::StoreClient;
use crate::SubscriptionGuard;
use crate::ValueCodec;

/// Outcome of re-arming the watch and re-reading the node.
#[derive(Debug, PartialEq, Eq)]
enum Synced<T> {
    Present(Option<T>),
    /// Node did not exist when the watch was armed
    Missing,
    /// Node existed but was gone by the time it was read
    Vanished,
}

pub struct ContentWatcher<C: ValueCodec, S: CoordinationClient = StoreClient> {
    path: NodePath,
    client: Arc<S>,
    codec: Arc<C>,
    cell: Arc<ContentCell<C::Value>>,
    retry: BackoffPolicy,
    cancel: CancellationToken,
    subscription: Mutex<Option<SubscriptionGuard>>,
}

impl<C: ValueCodec, S: CoordinationClient> std::fmt::Debug for ContentWatcher<C, S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ContentWatcher")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C: ValueCodec, S: CoordinationClient> ContentWatcher<C, S> {
    pub fn new(
        client: Arc<S>,
        path: NodePath,
        codec: C,
    ) -> Self {
        Self {
            path,
            client,
            codec: Arc::new(codec),
            cell: Arc::new(ContentCell::new()),
            retry: RetryPolicies::default().reconnect,
            cancel: CancellationToken::new(),
            subscription: Mutex::new(None),
        }
    }

    /// Backoff used when re-arming fails with a transient fault.
    pub fn with_retry_policy(
        mut self,
        retry: BackoffPolicy,
    ) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn state(&self) -> WatcherState {
        self.cell.state()
    }

    /// Subscribes to the node and, if it exists, loads its current value.
    ///
    /// Does not wait for a missing node to appear. Fails with
    /// `InvalidLifecycle` unless the watcher is freshly created; any other
    /// failure leaves the watcher stopped.
    pub async fn start(&self) -> Result<()> {
        self.cell.mark_started()?;

        // Listen before the first read so no event slips between the two
        let (events, guard) = self.client.subscribe_path(&self.path).into_parts();
        let initial = match sync(&*self.client, &self.path, &*self.codec).await {
            Ok(synced) => synced,
            Err(e) => {
                warn!(path = %self.path, "Content watcher failed to start: {:?}", e);
                self.cell.mark_stopped();
                return Err(e);
            }
        };
        if let Synced::Present(value) = initial {
            self.cell.update(CachedValue::Present(value));
        }

        {
            // `stop` cancels before taking this lock
            let mut subscription = self.subscription.lock();
            if self.cancel.is_cancelled() {
                debug!(path = %self.path, "Stopped while starting");
                return Ok(());
            }
            *subscription = Some(guard);
        }

        let event_loop = EventLoop {
            path: self.path.clone(),
            client: self.client.clone(),
            codec: self.codec.clone(),
            cell: self.cell.clone(),
            retry: self.retry,
            cancel: self.cancel.clone(),
        };
        spawn_task("content-watcher", move || event_loop.run(events), None);

        info!(path = %self.path, present = self.cell.value().is_present(), "Content watcher started");
        Ok(())
    }

    /// Current value, waiting for the node to be observed first.
    ///
    /// `Ok(None)` is a node that exists without content. Never fails for a
    /// missing node: it waits instead.
    pub async fn get_content(&self) -> Result<Option<C::Value>> {
        self.cell.wait_present().await
    }

    /// [`get_content`](Self::get_content) bounded by `limit`.
    pub async fn content_timeout(
        &self,
        limit: Duration,
    ) -> Result<Option<C::Value>> {
        match tokio::time::timeout(limit, self.get_content()).await {
            Ok(result) => result,
            Err(_) => Err(Error::WaitTimeout(limit)),
        }
    }

    /// [`get_content`](Self::get_content) that gives up with `Interrupted`
    /// once `token` is cancelled.
    pub async fn content_or_cancel(
        &self,
        token: &CancellationToken,
    ) -> Result<Option<C::Value>> {
        tokio::select! {
            _ = token.cancelled() => Err(Error::Interrupted),
            result = self.get_content() => result,
        }
    }

    /// Blocks the current thread until content is observed. Must not be
    /// called from within an async context.
    pub fn blocking_get_content(&self) -> Result<Option<C::Value>> {
        futures::executor::block_on(self.get_content())
    }

    /// Non-blocking peek; `None` while the node has not been observed.
    pub fn try_content(&self) -> Option<Option<C::Value>> {
        match self.cell.value() {
            CachedValue::Present(value) => Some(value),
            CachedValue::Absent => None,
        }
    }

    /// Stops watching. Safe at any point, including before or after a
    /// failed `start`; does not wait for an in-flight event to finish, but
    /// no cache update lands after it returns.
    pub fn stop(&self) {
        let previous = self.cell.mark_stopped();
        self.cancel.cancel();
        // After the cancel, so a concurrent `start` either sees it or has
        // already stored its guard
        let guard = self.subscription.lock().take();
        drop(guard);
        if previous != WatcherState::Stopped {
            info!(path = %self.path, "Content watcher stopped");
        }
    }
}

impl<C: ValueCodec, S: CoordinationClient> Drop for ContentWatcher<C, S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EventLoop<C: ValueCodec, S> {
    path: NodePath,
    client: Arc<S>,
    codec: Arc<C>,
    cell: Arc<ContentCell<C::Value>>,
    retry: BackoffPolicy,
    cancel: CancellationToken,
}

impl<C: ValueCodec, S: CoordinationClient> EventLoop<C, S> {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<PathEvent>,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            trace!(path = %self.path, ?event, "Handling path event");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.handle(event) => {}
            }
        }
        debug!(path = %self.path, "Content watcher event loop exited");
        Ok(())
    }

    async fn handle(
        &self,
        event: PathEvent,
    ) {
        if event == PathEvent::Deleted {
            self.apply(CachedValue::Absent);
        }

        let Some(synced) = self.sync_with_retry().await else {
            return;
        };
        match (event, synced) {
            (_, Synced::Present(value)) => self.apply(CachedValue::Present(value)),
            (_, Synced::Missing) => self.apply(CachedValue::Absent),
            (PathEvent::Resync | PathEvent::Deleted, Synced::Vanished) => self.apply(CachedValue::Absent),
            (PathEvent::Created | PathEvent::DataChanged, Synced::Vanished) => {
                debug!(path = %self.path, "Node vanished during read; keeping previous value");
            }
        }
    }

    fn apply(
        &self,
        value: CachedValue<C::Value>,
    ) {
        let present = value.is_present();
        if self.cell.update(value) {
            CONTENT_UPDATES.inc();
            trace!(path = %self.path, present, "Cache updated");
        }
    }

    /// Retries transient faults until the watch is armed again. `None` when
    /// the failure is permanent.
    async fn sync_with_retry(&self) -> Option<Synced<C::Value>> {
        let mut backoff = Backoff::new(self.retry);
        loop {
            match sync(&*self.client, &self.path, &*self.codec).await {
                Ok(synced) => return Some(synced),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(path = %self.path, ?delay, "Re-arming watch failed, retrying: {:?}", e);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(path = %self.path, "Giving up re-arming watch: {:?}", e);
                        return None;
                    }
                },
                Err(e) => {
                    warn!(path = %self.path, "Ignoring event after error: {:?}", e);
                    return None;
                }
            }
        }
    }
}

/// Arms the watch and reads the node.
async fn sync<C, S>(
    client: &S,
    path: &NodePath,
    codec: &C,
) -> Result<Synced<C::Value>>
where
    C: ValueCodec,
    S: CoordinationClient + ?Sized,
{
    if !client.exists_and_watch(path).await? {
        return Ok(Synced::Missing);
    }
    match client.read_content(path).await {
        Ok(payload) => Ok(Synced::Present(codec.decode(payload.as_deref())?)),
        Err(e) if e.is_node_not_found() => Ok(Synced::Vanished),
        Err(e) => Err(e),
    }
}
