//! Connection task behind [`StoreClient`](super::StoreClient).
//!
//! Owns the TCP transport. Establishes (or resumes) the session, forwards
//! queued calls, matches replies by xid, hands fired watches to the listener
//! registry and reconnects with backoff when the transport drops. Every
//! state transition is published on both the current-state watch channel
//! and the transition broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::listeners::ListenerRegistry;
use super::session::SessionInfo;
use super::session::SessionState;
use crate::metrics::SESSION_TRANSITIONS;
use crate::proto::decode_frame;
use crate::proto::encode_frame;
use crate::proto::frame_codec;
use crate::proto::ClientFrame;
use crate::proto::ConnectRequest;
use crate::proto::ConnectResponse;
use crate::proto::Request;
use crate::proto::Response;
use crate::proto::ServerFrame;
use crate::utils::backoff::Backoff;
use crate::BackoffPolicy;
use crate::ClientConfig;
use crate::Error;
use crate::Result;

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

/// Reserved for keep-alive pings; replies to it are not routed.
const PING_XID: u64 = 0;

/// A request waiting to be written, with the slot its reply goes to.
pub(crate) struct Call {
    pub(crate) request: Request,
    pub(crate) reply: oneshot::Sender<Result<Response>>,
}

enum SessionEnd {
    /// Transport dropped; reconnect
    Lost,
    /// Client is shutting down
    Shutdown,
}

pub(crate) struct ConnectionActor {
    config: ClientConfig,
    reconnect: BackoffPolicy,
    calls: mpsc::UnboundedReceiver<Call>,
    state: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    session: Arc<ArcSwapOption<SessionInfo>>,
    registry: Arc<ListenerRegistry>,
    shutdown: CancellationToken,
    pending: HashMap<u64, oneshot::Sender<Result<Response>>>,
    next_xid: u64,
}

impl ConnectionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ClientConfig,
        reconnect: BackoffPolicy,
        calls: mpsc::UnboundedReceiver<Call>,
        state: watch::Sender<SessionState>,
        transitions: broadcast::Sender<SessionState>,
        session: Arc<ArcSwapOption<SessionInfo>>,
        registry: Arc<ListenerRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            reconnect,
            calls,
            state,
            transitions,
            session,
            registry,
            shutdown,
            pending: HashMap::new(),
            next_xid: PING_XID + 1,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let mut backoff = Backoff::new(self.reconnect);

        loop {
            let session_id = self.session.load().as_ref().map(|s| s.session_id);
            let attempt = establish(self.config.clone(), session_id);
            let Some(outcome) = self.reject_calls_until(attempt).await else {
                break;
            };

            match outcome {
                Ok((transport, ConnectResponse::Established { session_id, session_timeout_ms, resumed })) => {
                    backoff.reset();
                    let timeout = Duration::from_millis(session_timeout_ms);
                    self.session.store(Some(Arc::new(SessionInfo { session_id, timeout })));

                    if resumed {
                        self.publish(SessionState::Reconnected);
                    } else {
                        info!(session_id, ?timeout, "Session established");
                        self.publish(SessionState::Connected);
                    }

                    match self.serve(transport, timeout).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost => {
                            // Listeners learn about the outage before callers see their errors
                            self.publish(SessionState::Disconnected);
                            self.fail_pending(|| Error::ConnectionLoss);
                        }
                    }
                }
                Ok((_, ConnectResponse::Expired)) => {
                    warn!(?session_id, "Session expired; opening a new one");
                    self.session.store(None);
                    self.publish(SessionState::Expired);
                }
                Err(e) => {
                    debug!(attempt = backoff.attempt(), "Connect attempt failed: {:?}", e);
                    match backoff.next_delay() {
                        Some(delay) => {
                            if self.reject_calls_until(tokio::time::sleep(delay)).await.is_none() {
                                break;
                            }
                        }
                        None => {
                            warn!("Reconnect attempts exhausted; closing client");
                            break;
                        }
                    }
                }
            }
        }

        self.publish(SessionState::Closed);
        self.fail_pending(|| Error::ClientClosed);
        self.calls.close();
        while let Ok(call) = self.calls.try_recv() {
            let _ = call.reply.send(Err(Error::ClientClosed));
        }
        Ok(())
    }

    fn publish(
        &self,
        state: SessionState,
    ) {
        debug!(%state, "Session state");
        SESSION_TRANSITIONS.with_label_values(&[state.as_str()]).inc();
        self.state.send_replace(state);
        let _ = self.transitions.send(state);
    }

    fn fail_pending<F>(
        &mut self,
        error: F,
    ) where
        F: Fn() -> Error,
    {
        for (xid, reply) in self.pending.drain() {
            trace!(xid, "Failing in-flight request");
            let _ = reply.send(Err(error()));
        }
    }

    /// Drives `fut` to completion while answering queued calls with
    /// `ConnectionLoss`. `None` when the client shuts down first.
    async fn reject_calls_until<F>(
        &mut self,
        fut: F,
    ) -> Option<F::Output>
    where
        F: std::future::Future,
    {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                out = &mut fut => return Some(out),
                call = self.calls.recv() => match call {
                    Some(call) => {
                        let _ = call.reply.send(Err(Error::ConnectionLoss));
                    }
                    None => return None,
                },
            }
        }
    }

    async fn serve(
        &mut self,
        transport: Transport,
        session_timeout: Duration,
    ) -> SessionEnd {
        let (mut sink, mut stream) = transport.split();
        let mut ping = tokio::time::interval(session_timeout / 3);
        let read_deadline = session_timeout * 2 / 3;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                call = self.calls.recv() => {
                    let Some(call) = call else {
                        return SessionEnd::Shutdown;
                    };
                    let xid = self.next_xid;
                    self.next_xid += 1;
                    let frame = ClientFrame::Request { xid, request: call.request };
                    match encode_frame(&frame) {
                        Ok(bytes) => {
                            self.pending.insert(xid, call.reply);
                            if let Err(e) = sink.send(bytes).await {
                                warn!("Write to store failed: {:?}", e);
                                return SessionEnd::Lost;
                            }
                        }
                        Err(e) => {
                            let _ = call.reply.send(Err(e));
                        }
                    }
                }
                _ = ping.tick() => {
                    if last_heard.elapsed() > read_deadline {
                        warn!(?read_deadline, "No traffic from store; dropping connection");
                        return SessionEnd::Lost;
                    }
                    let frame = ClientFrame::Request { xid: PING_XID, request: Request::Ping };
                    let sent = match encode_frame(&frame) {
                        Ok(bytes) => sink.send(bytes).await.map_err(Error::from),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!("Ping failed: {:?}", e);
                        return SessionEnd::Lost;
                    }
                }
                inbound = stream.next() => {
                    let bytes = match inbound {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            warn!("Read from store failed: {:?}", e);
                            return SessionEnd::Lost;
                        }
                        None => {
                            info!("Store closed the connection");
                            return SessionEnd::Lost;
                        }
                    };
                    last_heard = Instant::now();
                    match decode_frame::<ServerFrame>(&bytes) {
                        Ok(ServerFrame::Reply { xid: PING_XID, .. }) => {}
                        Ok(ServerFrame::Reply { xid, response }) => match self.pending.remove(&xid) {
                            Some(reply) => {
                                let _ = reply.send(Ok(response));
                            }
                            None => debug!(xid, "Reply for unknown request"),
                        },
                        Ok(ServerFrame::Event(event)) => self.registry.dispatch(&event),
                        Ok(ServerFrame::Connected(_)) => {
                            warn!("Unexpected handshake frame mid-session");
                            return SessionEnd::Lost;
                        }
                        Err(e) => {
                            warn!("Undecodable frame from store: {:?}", e);
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }
}

/// Opens a transport and performs the session handshake within the connect
/// timeout.
async fn establish(
    config: ClientConfig,
    session_id: Option<u64>,
) -> Result<(Transport, ConnectResponse)> {
    let limit = config.connect_timeout();
    match timeout(limit, handshake(&config, session_id)).await {
        Ok(result) => result,
        Err(_) => Err(Error::OperationTimeout(limit)),
    }
}

async fn handshake(
    config: &ClientConfig,
    session_id: Option<u64>,
) -> Result<(Transport, ConnectResponse)> {
    let stream = TcpStream::connect(config.connect_string.as_str()).await?;
    stream.set_nodelay(true)?;
    let mut transport = Framed::new(stream, frame_codec());

    let hello = ClientFrame::Connect(ConnectRequest {
        session_id,
        session_timeout_ms: config.session_timeout_ms,
    });
    transport.send(encode_frame(&hello)?).await?;

    match transport.next().await {
        Some(Ok(bytes)) => match decode_frame::<ServerFrame>(&bytes)? {
            ServerFrame::Connected(response) => Ok((transport, response)),
            other => Err(Error::Protocol(format!("expected handshake reply, got {other:?}"))),
        },
        Some(Err(e)) => Err(e.into()),
        None => Err(Error::ConnectionLoss),
    }
}
