//! Per-path listener registry.
//!
//! Fired store watches arrive on the connection task and are fanned out to
//! every subscription registered for the event's path. The same registry is
//! what the session recovery handler walks to ask each subscriber to
//! resynchronize after a reconnection.
//!
//! Subscriptions unregister themselves when dropped.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::metrics::RESYNC_REQUESTS;
use crate::metrics::WATCH_EVENTS;
use crate::proto::EventType;
use crate::proto::WatchedEvent;
use crate::NodePath;

/// What a path subscriber is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    Created,
    DataChanged,
    Deleted,
    /// The session was resumed or replaced; armed watches may be gone
    Resync,
}

impl From<EventType> for PathEvent {
    fn from(event_type: EventType) -> Self {
        match event_type {
            EventType::NodeCreated => PathEvent::Created,
            EventType::NodeDataChanged => PathEvent::DataChanged,
            EventType::NodeDeleted => PathEvent::Deleted,
        }
    }
}

#[derive(Debug)]
struct Listener {
    id: u64,
    sender: mpsc::UnboundedSender<PathEvent>,
}

#[derive(Debug)]
pub(crate) struct ListenerRegistry {
    /// Listeners grouped by path
    listeners: DashMap<String, Vec<Listener>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        path: &NodePath,
    ) -> PathSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners
            .entry(path.to_string())
            .or_default()
            .push(Listener { id, sender });

        trace!(listener_id = id, path = %path, "Listener registered");

        PathSubscription {
            receiver,
            guard: SubscriptionGuard {
                cleanup: Some(ListenerCleanup {
                    id,
                    path: path.to_string(),
                    registry: self.clone(),
                }),
            },
        }
    }

    pub(crate) fn dispatch(
        &self,
        event: &WatchedEvent,
    ) {
        WATCH_EVENTS.with_label_values(&[event.event_type.as_str()]).inc();
        if let Some(listeners) = self.listeners.get(&event.path) {
            let path_event = PathEvent::from(event.event_type);
            for listener in listeners.iter() {
                let _ = listener.sender.send(path_event);
            }
            trace!(
                path = %event.path,
                event_type = ?event.event_type,
                listeners = listeners.len(),
                "Event dispatched"
            );
        }
    }

    /// Asks every live listener to resynchronize. Returns how many were asked.
    pub(crate) fn resync_all(&self) -> usize {
        let mut notified = 0;
        for entry in self.listeners.iter() {
            for listener in entry.value() {
                if listener.sender.send(PathEvent::Resync).is_ok() {
                    notified += 1;
                }
            }
        }
        RESYNC_REQUESTS.inc_by(notified as u64);
        notified
    }

    pub(crate) fn listener_count(
        &self,
        path: &str,
    ) -> usize {
        self.listeners.get(path).map(|l| l.len()).unwrap_or(0)
    }

    pub(crate) fn watched_path_count(&self) -> usize {
        self.listeners.len()
    }

    fn unregister(
        &self,
        cleanup: &ListenerCleanup,
    ) {
        // Atomic check-and-remove so a concurrent register on the same path
        // never lands in a list that is about to be dropped.
        self.listeners.remove_if_mut(&cleanup.path, |_path, listeners| {
            listeners.retain(|l| l.id != cleanup.id);
            listeners.is_empty()
        });
    }
}

struct ListenerCleanup {
    id: u64,
    path: String,
    registry: Arc<ListenerRegistry>,
}

/// Keeps a listener registered; unregisters on drop.
pub struct SubscriptionGuard {
    cleanup: Option<ListenerCleanup>,
}

impl SubscriptionGuard {
    /// Guard that is not tied to any registry.
    pub fn detached() -> Self {
        Self { cleanup: None }
    }

    pub fn id(&self) -> Option<u64> {
        self.cleanup.as_ref().map(|c| c.id)
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard").field("id", &self.id()).finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.registry.unregister(&cleanup);
            trace!(listener_id = cleanup.id, path = %cleanup.path, "Listener unregistered");
        }
    }
}

/// Stream of events for one path.
#[derive(Debug)]
pub struct PathSubscription {
    receiver: mpsc::UnboundedReceiver<PathEvent>,
    guard: SubscriptionGuard,
}

impl PathSubscription {
    /// Wraps a bare receiver, for `CoordinationClient` implementations that
    /// deliver events through their own channel.
    pub fn from_receiver(receiver: mpsc::UnboundedReceiver<PathEvent>) -> Self {
        Self {
            receiver,
            guard: SubscriptionGuard::detached(),
        }
    }

    pub async fn recv(&mut self) -> Option<PathEvent> {
        self.receiver.recv().await
    }

    pub fn id(&self) -> Option<u64> {
        self.guard.id()
    }

    /// Splits the subscription so the receiver and the registration can be
    /// owned by different parties.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<PathEvent>, SubscriptionGuard) {
        (self.receiver, self.guard)
    }
}
