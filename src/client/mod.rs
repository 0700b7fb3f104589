//! Store client with automatic reconnection.
//!
//! [`StoreClient`] is a cheap-to-clone handle onto a background connection
//! task. Operations are retried across connection loss until the configured
//! operation timeout elapses; fired watches are routed to per-path
//! subscriptions, and a recovery task asks those subscribers to resynchronize
//! whenever the connection comes back.

mod connection;
mod listeners;
mod recovery;
mod session;


use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use self::connection::Call;
use self::connection::ConnectionActor;
pub(crate) use self::listeners::ListenerRegistry;
pub use self::listeners::PathEvent;
pub use self::listeners::PathSubscription;
pub use self::listeners::SubscriptionGuard;
use self::recovery::SessionRecovery;
pub use self::session::SessionInfo;
pub use self::session::SessionState;
use crate::proto::CreateMode;
use crate::proto::Request;
use crate::proto::Response;
use crate::proto::Stat;
use crate::utils::async_task::spawn_task;
use crate::ClientConfig;
use crate::Error;
use crate::NodePath;
use crate::Result;
use crate::RetryPolicies;
use crate::StoreConfig;
use crate::ValueCodec;
use crate::WatchConfig;

/// What a content watcher needs from the store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Reports whether `path` exists and arms a one-shot watch that fires on
    /// its creation, data change or deletion.
    async fn exists_and_watch(
        &self,
        path: &NodePath,
    ) -> Result<bool>;

    /// Raw content of `path`; `Ok(None)` for a node stored without content.
    async fn read_content(
        &self,
        path: &NodePath,
    ) -> Result<Option<Vec<u8>>>;

    /// Registers for events on `path` until the subscription is dropped.
    fn subscribe_path(
        &self,
        path: &NodePath,
    ) -> PathSubscription;
}

struct ClientInner {
    config: ClientConfig,
    calls: mpsc::UnboundedSender<Call>,
    state: watch::Receiver<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    session: Arc<ArcSwapOption<SessionInfo>>,
    registry: Arc<ListenerRegistry>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle on a store session.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for StoreClient {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("connect_string", &self.inner.config.connect_string)
            .field("state", &self.session_state())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl StoreClient {
    /// Starts the connection task and waits for the first session, bounded
    /// by the operation timeout.
    pub async fn connect(
        config: ClientConfig,
        retry: RetryPolicies,
        watch_config: WatchConfig,
    ) -> Result<Self> {
        config.validate()?;
        retry.validate()?;
        watch_config.validate()?;

        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (transitions, _) = broadcast::channel(watch_config.session_event_buffer);
        let session = Arc::new(ArcSwapOption::empty());
        let registry = Arc::new(ListenerRegistry::new());
        let shutdown = CancellationToken::new();

        if watch_config.resync_on_reconnect {
            // Subscribe before the connection task can publish anything
            let recovery = SessionRecovery::new(registry.clone());
            let receiver = transitions.subscribe();
            let token = shutdown.clone();
            spawn_task("session-recovery", move || recovery.run(receiver, token), None);
        }

        let actor = ConnectionActor::new(
            config.clone(),
            retry.reconnect,
            calls_rx,
            state_tx,
            transitions.clone(),
            session.clone(),
            registry.clone(),
            shutdown.clone(),
        );
        spawn_task("store-connection", move || actor.run(), None);

        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                calls: calls_tx,
                state: state_rx,
                transitions,
                session,
                registry,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        };

        let deadline = Instant::now() + client.inner.config.operation_timeout();
        client.wait_until_connected(deadline).await?;
        info!(connect_string = %client.inner.config.connect_string, session_id = ?client.session_id(), "Store client connected");
        Ok(client)
    }

    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::connect(config.client.clone(), config.retry.clone(), config.watch.clone()).await
    }

    pub fn session_state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Id of the current session, `None` while none is established.
    pub fn session_id(&self) -> Option<u64> {
        self.inner.session.load().as_ref().map(|s| s.session_id)
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session.load().as_deref().copied()
    }

    /// Every transition from now on.
    pub fn subscribe_session_state(&self) -> broadcast::Receiver<SessionState> {
        self.inner.transitions.subscribe()
    }

    /// Current state, changes included; useful to wait for a given state.
    pub fn watch_session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.clone()
    }

    pub fn subscribe_path(
        &self,
        path: &NodePath,
    ) -> PathSubscription {
        self.inner.registry.register(path)
    }

    /// Live subscriptions on `path`.
    pub fn listener_count(
        &self,
        path: &NodePath,
    ) -> usize {
        self.inner.registry.listener_count(path.as_str())
    }

    pub fn watched_path_count(&self) -> usize {
        self.inner.registry.watched_path_count()
    }

    pub async fn create_node(
        &self,
        path: &NodePath,
        content: Option<Vec<u8>>,
        mode: CreateMode,
    ) -> Result<()> {
        let request = Request::Create {
            path: path.to_string(),
            data: content,
            mode,
        };
        match self.call(request).await? {
            Response::Created => Ok(()),
            other => Err(unexpected(path, other)),
        }
    }

    /// Creates `path` and any missing ancestors as empty persistent nodes.
    /// Succeeds when the node already exists.
    pub async fn ensure_path(
        &self,
        path: &NodePath,
    ) -> Result<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(path.clone());
        while let Some(current) = cursor {
            if current.is_root() || self.exists(&current).await? {
                break;
            }
            cursor = current.parent();
            missing.push(current);
        }

        for node in missing.into_iter().rev() {
            match self.create_node(&node, None, CreateMode::Persistent).await {
                Ok(()) | Err(Error::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn read_content(
        &self,
        path: &NodePath,
    ) -> Result<Option<Vec<u8>>> {
        self.get_data(path, false).await
    }

    /// Reads and arms a data watch in one round trip.
    pub async fn read_content_and_watch(
        &self,
        path: &NodePath,
    ) -> Result<Option<Vec<u8>>> {
        self.get_data(path, true).await
    }

    pub async fn write_content(
        &self,
        path: &NodePath,
        content: Option<Vec<u8>>,
    ) -> Result<Stat> {
        let request = Request::SetData {
            path: path.to_string(),
            data: content,
        };
        match self.call(request).await? {
            Response::Stat(stat) => Ok(stat),
            other => Err(unexpected(path, other)),
        }
    }

    pub async fn delete_node(
        &self,
        path: &NodePath,
    ) -> Result<()> {
        match self.call(Request::Delete { path: path.to_string() }).await? {
            Response::Deleted => Ok(()),
            other => Err(unexpected(path, other)),
        }
    }

    pub async fn exists(
        &self,
        path: &NodePath,
    ) -> Result<bool> {
        Ok(self.stat(path, false).await?.is_some())
    }

    pub async fn exists_and_watch(
        &self,
        path: &NodePath,
    ) -> Result<bool> {
        Ok(self.stat(path, true).await?.is_some())
    }

    /// Metadata of `path`, `None` if it does not exist.
    pub async fn stat(
        &self,
        path: &NodePath,
        watch: bool,
    ) -> Result<Option<Stat>> {
        let request = Request::Exists {
            path: path.to_string(),
            watch,
        };
        match self.call(request).await? {
            Response::Exists(stat) => Ok(stat),
            other => Err(unexpected(path, other)),
        }
    }

    /// Encodes `value` with `codec` and creates the node with it.
    pub async fn create_value<C: ValueCodec>(
        &self,
        path: &NodePath,
        codec: &C,
        value: Option<&C::Value>,
        mode: CreateMode,
    ) -> Result<()> {
        let content = codec.encode(value)?;
        self.create_node(path, content, mode).await
    }

    pub async fn write_value<C: ValueCodec>(
        &self,
        path: &NodePath,
        codec: &C,
        value: Option<&C::Value>,
    ) -> Result<Stat> {
        let content = codec.encode(value)?;
        self.write_content(path, content).await
    }

    pub async fn read_value<C: ValueCodec>(
        &self,
        path: &NodePath,
        codec: &C,
    ) -> Result<Option<C::Value>> {
        let content = self.read_content(path).await?;
        Ok(codec.decode(content.as_deref())?)
    }

    /// Ends the session and stops the connection task. Ephemeral nodes of
    /// the session are removed by the server.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.session_state().is_connected() {
            let deadline = Instant::now() + self.inner.config.request_timeout();
            if let Err(e) = self.send_once(Request::CloseSession, deadline).await {
                debug!("Close session request failed: {:?}", e);
            }
        }
        self.inner.shutdown.cancel();
        info!(connect_string = %self.inner.config.connect_string, "Store client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.session_state() == SessionState::Closed
    }

    async fn get_data(
        &self,
        path: &NodePath,
        watch: bool,
    ) -> Result<Option<Vec<u8>>> {
        let request = Request::GetData {
            path: path.to_string(),
            watch,
        };
        match self.call(request).await? {
            Response::Data { data, .. } => Ok(data),
            other => Err(unexpected(path, other)),
        }
    }

    /// Sends `request`, retrying across connection loss until the operation
    /// timeout elapses.
    async fn call(
        &self,
        request: Request,
    ) -> Result<Response> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        let deadline = Instant::now() + self.inner.config.operation_timeout();
        loop {
            self.wait_until_connected(deadline).await?;
            match self.send_once(request.clone(), deadline).await {
                Err(Error::ConnectionLoss) => {
                    debug!(kind = request.kind(), path = request.path(), "Connection lost; retrying once reconnected");
                }
                other => return other,
            }
        }
    }

    async fn send_once(
        &self,
        request: Request,
        deadline: Instant,
    ) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .calls
            .send(Call { request, reply: reply_tx })
            .map_err(|_| Error::ClientClosed)?;

        let request_timeout = self.inner.config.request_timeout();
        let request_deadline = deadline.min(Instant::now() + request_timeout);
        match timeout_at(request_deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ClientClosed),
            Err(_) => Err(Error::OperationTimeout(request_timeout)),
        }
    }

    async fn wait_until_connected(
        &self,
        deadline: Instant,
    ) -> Result<()> {
        let mut state = self.inner.state.clone();
        let waited = timeout_at(deadline, state.wait_for(|s| s.is_connected() || *s == SessionState::Closed)).await;
        match waited {
            Err(_) => Err(Error::OperationTimeout(self.inner.config.operation_timeout())),
            Ok(Err(_)) => Err(Error::ClientClosed),
            Ok(Ok(current)) => {
                if *current == SessionState::Closed {
                    Err(Error::ClientClosed)
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn unexpected(
    path: &NodePath,
    response: Response,
) -> Error {
    match response {
        Response::Error(code) => Error::from_code(code, path.as_str()),
        other => Error::Protocol(format!("unexpected response {other:?} for {path}")),
    }
}

#[async_trait]
impl CoordinationClient for StoreClient {
    async fn exists_and_watch(
        &self,
        path: &NodePath,
    ) -> Result<bool> {
        StoreClient::exists_and_watch(self, path).await
    }

    async fn read_content(
        &self,
        path: &NodePath,
    ) -> Result<Option<Vec<u8>>> {
        StoreClient::read_content(self, path).await
    }

    fn subscribe_path(
        &self,
        path: &NodePath,
    ) -> PathSubscription {
        StoreClient::subscribe_path(self, path)
    }
}
