//! Embedded coordination store server.
//!
//! A small, single process stand-in for the real store: a hierarchical data
//! tree, sessions that outlive their TCP connection for the negotiated
//! timeout, ephemeral nodes bound to a session, and one-shot watches bound to
//! the connection that armed them. Intended for tests and local tooling; it
//! speaks the same wire protocol as the production client expects.

mod connection;
mod data_tree;
mod session;


use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use self::data_tree::DataTree;
use self::data_tree::Notifications;
use self::session::SessionTracker;
use crate::proto::ConnectRequest;
use crate::proto::ConnectResponse;
use crate::proto::ErrorCode;
use crate::proto::Request;
use crate::proto::Response;
use crate::proto::ServerFrame;
use crate::utils::async_task::spawn_task;
use crate::NodePath;
use crate::Result;
use crate::ServerConfig;

/// Outbound side of a live connection.
struct ConnectionHandle {
    sender: mpsc::UnboundedSender<ServerFrame>,
    /// Cancelled when another connection takes over the session
    kill: CancellationToken,
}

pub(crate) struct ServerState {
    config: ServerConfig,
    tree: Mutex<DataTree>,
    sessions: Mutex<SessionTracker>,
    connections: DashMap<u64, ConnectionHandle>,
    next_conn_id: AtomicU64,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            tree: Mutex::new(DataTree::new()),
            sessions: Mutex::new(SessionTracker::new()),
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn handshake(
        &self,
        conn_id: u64,
        request: &ConnectRequest,
    ) -> ConnectResponse {
        let mut sessions = self.sessions.lock();
        match request.session_id {
            None => {
                let timeout_ms = self.config.negotiate_session_timeout(request.session_timeout_ms);
                let session_id = sessions.open(conn_id, std::time::Duration::from_millis(timeout_ms));
                info!(session_id, conn_id, timeout_ms, "Session established");
                ConnectResponse::Established {
                    session_id,
                    session_timeout_ms: timeout_ms,
                    resumed: false,
                }
            }
            Some(session_id) => match sessions.resume(session_id, conn_id) {
                Some(previous) => {
                    if let Some(previous) = previous.filter(|prev| *prev != conn_id) {
                        if let Some(handle) = self.connections.get(&previous) {
                            handle.kill.cancel();
                        }
                    }
                    let timeout_ms = sessions
                        .timeout_of(session_id)
                        .map(|t| t.as_millis() as u64)
                        .unwrap_or(request.session_timeout_ms);
                    info!(session_id, conn_id, "Session resumed");
                    ConnectResponse::Established {
                        session_id,
                        session_timeout_ms: timeout_ms,
                        resumed: true,
                    }
                }
                None => {
                    info!(session_id, conn_id, "Rejecting unknown or expired session");
                    ConnectResponse::Expired
                }
            },
        }
    }

    pub(crate) fn attach(
        &self,
        conn_id: u64,
        sender: mpsc::UnboundedSender<ServerFrame>,
        kill: CancellationToken,
    ) {
        self.connections.insert(conn_id, ConnectionHandle { sender, kill });
    }

    pub(crate) fn connection_closed(
        &self,
        conn_id: u64,
        session_id: u64,
    ) {
        self.connections.remove(&conn_id);
        self.tree.lock().remove_watches(conn_id);
        self.sessions.lock().detach(session_id, conn_id);
        debug!(conn_id, session_id, "Connection closed");
    }

    pub(crate) fn handle_request(
        &self,
        conn_id: u64,
        session_id: u64,
        request: Request,
    ) -> Response {
        trace!(conn_id, session_id, kind = request.kind(), path = request.path(), "Request");
        if !self.sessions.lock().is_alive(session_id) {
            return Response::Error(ErrorCode::SessionExpired);
        }

        match request {
            Request::Ping => Response::Pong,
            Request::CloseSession => {
                self.close_session(session_id);
                Response::Closed
            }
            Request::Create { path, data, mode } => with_path(&path, |path| {
                let mut tree = self.tree.lock();
                let fired = tree.create(&path, data, mode, session_id)?;
                self.deliver(fired);
                Ok(Response::Created)
            }),
            Request::GetData { path, watch } => with_path(&path, |path| {
                let (data, stat) = self.tree.lock().get_data(&path, watch.then_some(conn_id))?;
                Ok(Response::Data { data, stat })
            }),
            Request::SetData { path, data } => with_path(&path, |path| {
                let mut tree = self.tree.lock();
                let (stat, fired) = tree.set_data(&path, data)?;
                self.deliver(fired);
                Ok(Response::Stat(stat))
            }),
            Request::Exists { path, watch } => with_path(&path, |path| {
                Ok(Response::Exists(self.tree.lock().exists(&path, watch.then_some(conn_id))))
            }),
            Request::Delete { path } => with_path(&path, |path| {
                let mut tree = self.tree.lock();
                let fired = tree.delete(&path)?;
                self.deliver(fired);
                Ok(Response::Deleted)
            }),
        }
    }

    /// Queues fired watch events; callers hold the tree lock.
    fn deliver(
        &self,
        fired: Notifications,
    ) {
        for (conn_id, event) in fired {
            match self.connections.get(&conn_id) {
                Some(handle) => {
                    trace!(conn_id, path = %event.path, event_type = ?event.event_type, "Watch fired");
                    let _ = handle.sender.send(ServerFrame::Event(event));
                }
                None => debug!(conn_id, "Dropping event for vanished connection"),
            }
        }
    }

    fn close_session(
        &self,
        session_id: u64,
    ) -> Option<u64> {
        let entry = self.sessions.lock().close(session_id)?;
        let mut tree = self.tree.lock();
        let fired = tree.delete_ephemerals(session_id);
        self.deliver(fired);
        info!(session_id, "Session closed");
        entry.conn_id
    }

    fn expire_sessions(&self) {
        let expired = self.sessions.lock().expire(Instant::now());
        for session_id in expired {
            let mut tree = self.tree.lock();
            let fired = tree.delete_ephemerals(session_id);
            self.deliver(fired);
            info!(session_id, "Session expired");
        }
    }
}

fn with_path<F>(
    raw: &str,
    op: F,
) -> Response
where
    F: FnOnce(NodePath) -> std::result::Result<Response, ErrorCode>,
{
    match NodePath::new(raw) {
        Ok(path) => op(path).unwrap_or_else(Response::Error),
        Err(_) => Response::Error(ErrorCode::BadArguments),
    }
}

/// Handle on a running embedded store.
///
/// Dropping the handle stops the accept loop and every connection.
pub struct StoreServer {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for StoreServer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StoreServer").field("local_addr", &self.local_addr).finish_non_exhaustive()
    }
}

impl StoreServer {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let tick = config.tick();
        let state = Arc::new(ServerState::new(config));
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        spawn_task(
            "store-accept",
            move || accept_loop(listener, accept_state, accept_shutdown),
            Some(&mut handles),
        );

        let expiry_state = state.clone();
        let expiry_shutdown = shutdown.clone();
        spawn_task(
            "store-session-expiry",
            move || async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = expiry_shutdown.cancelled() => return Ok(()),
                        _ = interval.tick() => expiry_state.expire_sessions(),
                    }
                }
            },
            Some(&mut handles),
        );

        info!(%local_addr, "Store server listening");
        Ok(Self {
            local_addr,
            state,
            shutdown,
            handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` suitable for `ClientConfig::connect_string`.
    pub fn connect_string(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    /// Armed one-shot watches across all connections.
    pub fn watch_count(&self) -> usize {
        self.state.tree.lock().watch_count()
    }

    pub fn node_count(&self) -> usize {
        self.state.tree.lock().node_count()
    }

    /// Forcibly ends a session and drops its connection, as if it had
    /// timed out. The owning client sees a disconnect and then `Expired`.
    pub fn expire_session(
        &self,
        session_id: u64,
    ) -> bool {
        let Some(entry) = self.state.sessions.lock().close(session_id) else {
            return false;
        };
        if let Some(conn_id) = entry.conn_id {
            if let Some(handle) = self.state.connections.get(&conn_id) {
                handle.kill.cancel();
            }
        }
        let mut tree = self.state.tree.lock();
        let fired = tree.delete_ephemerals(session_id);
        self.state.deliver(fired);
        warn!(session_id, "Session expired on request");
        true
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!(local_addr = %self.local_addr, "Store server stopped");
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {:?}", e);
                    continue;
                }
            },
        };
        debug!(%peer, "Accepted connection");
        let state = state.clone();
        let shutdown = shutdown.child_token();
        spawn_task(
            "store-connection",
            move || connection::serve_connection(state, stream, shutdown),
            None,
        );
    }
}
