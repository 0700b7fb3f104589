use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

/// Server side view of a client session.
#[derive(Debug, Clone)]
pub(crate) struct SessionEntry {
    pub(crate) timeout: Duration,
    /// Connection currently serving the session
    pub(crate) conn_id: Option<u64>,
    /// When the session last lost its connection
    pub(crate) detached_at: Instant,
}

/// Tracks session ownership of connections and expiry of orphaned sessions.
#[derive(Debug, Default)]
pub(crate) struct SessionTracker {
    sessions: HashMap<u64, SessionEntry>,
    next_id: u64,
}

impl SessionTracker {
    pub(crate) fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn open(
        &mut self,
        conn_id: u64,
        timeout: Duration,
    ) -> u64 {
        let session_id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(
            session_id,
            SessionEntry {
                timeout,
                conn_id: Some(conn_id),
                detached_at: Instant::now(),
            },
        );
        session_id
    }

    /// Binds a known session to a new connection. Returns the previous
    /// connection if one was still attached.
    pub(crate) fn resume(
        &mut self,
        session_id: u64,
        conn_id: u64,
    ) -> Option<Option<u64>> {
        let entry = self.sessions.get_mut(&session_id)?;
        Some(entry.conn_id.replace(conn_id))
    }

    pub(crate) fn timeout_of(
        &self,
        session_id: u64,
    ) -> Option<Duration> {
        self.sessions.get(&session_id).map(|entry| entry.timeout)
    }

    /// Marks the session orphaned if `conn_id` still owns it.
    pub(crate) fn detach(
        &mut self,
        session_id: u64,
        conn_id: u64,
    ) {
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            if entry.conn_id == Some(conn_id) {
                entry.conn_id = None;
                entry.detached_at = Instant::now();
            }
        }
    }

    pub(crate) fn close(
        &mut self,
        session_id: u64,
    ) -> Option<SessionEntry> {
        self.sessions.remove(&session_id)
    }

    /// Removes and returns sessions orphaned longer than their timeout.
    pub(crate) fn expire(
        &mut self,
        now: Instant,
    ) -> Vec<u64> {
        let expired: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.conn_id.is_none() && now.duration_since(entry.detached_at) >= entry.timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    pub(crate) fn is_alive(
        &self,
        session_id: u64,
    ) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}
