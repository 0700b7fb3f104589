//! TCP fault injector.
//!
//! A gateway sits between a client and the store and forwards bytes in both
//! directions while started. Stopping it severs every piped connection and
//! closes new ones right after accepting them, which the client observes as
//! a dropped transport. The listening socket stays bound throughout so the
//! client keeps dialing the same address across stop/start cycles.

use std::net::SocketAddr;

use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::utils::async_task::spawn_task;
use crate::Result;

pub struct Gateway {
    local_addr: SocketAddr,
    target: SocketAddr,
    active: watch::Sender<bool>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("local_addr", &self.local_addr)
            .field("target", &self.target)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Gateway {
    /// Binds `listen` and forwards to `target` once started. Created
    /// stopped.
    pub async fn bind(
        listen: impl ToSocketAddrs,
        target: SocketAddr,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let local_addr = listener.local_addr()?;
        let (active, _) = watch::channel(false);
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let accept_active = active.subscribe();
        let accept_shutdown = shutdown.clone();
        spawn_task(
            "gateway-accept",
            move || accept_loop(listener, target, accept_active, accept_shutdown),
            Some(&mut handles),
        );

        debug!(%local_addr, %target, "Gateway bound");
        Ok(Self {
            local_addr,
            target,
            active,
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

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Starts forwarding. Idempotent.
    pub fn start(&self) {
        if !self.active.send_replace(true) {
            info!(local_addr = %self.local_addr, target = %self.target, "Gateway started");
        }
    }

    /// Severs every piped connection and refuses new ones. Idempotent.
    pub fn stop(&self) {
        if self.active.send_replace(false) {
            info!(local_addr = %self.local_addr, "Gateway stopped");
        }
    }

    /// Closes the listener and every piped connection.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: SocketAddr,
    active: watch::Receiver<bool>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (inbound, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Gateway accept failed: {:?}", e);
                    continue;
                }
            },
        };

        if !*active.borrow() {
            trace!(%peer, "Gateway stopped; closing accepted connection");
            drop(inbound);
            continue;
        }

        let active = active.clone();
        let shutdown = shutdown.child_token();
        spawn_task(
            "gateway-pipe",
            move || pipe(inbound, peer, target, active, shutdown),
            None,
        );
    }
}

/// Forwards one connection until either side closes, the gateway stops or
/// it shuts down.
async fn pipe(
    mut inbound: TcpStream,
    peer: SocketAddr,
    target: SocketAddr,
    mut active: watch::Receiver<bool>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    inbound.set_nodelay(true)?;
    outbound.set_nodelay(true)?;
    trace!(%peer, %target, "Gateway piping");

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = active.wait_for(|active| !*active) => {
            debug!(%peer, "Gateway severed connection");
        }
        copied = copy_bidirectional(&mut inbound, &mut outbound) => match copied {
            Ok((up, down)) => trace!(%peer, up, down, "Gateway pipe closed"),
            Err(e) => debug!(%peer, "Gateway pipe failed: {:?}", e),
        },
    }
    Ok(())
}
