//! TCP accept loop for tracker connections.
//!
//! The loop only admits or rejects; all packet I/O happens in the spawned
//! handler. Admission checks, in order: the abuse guard, then the connection
//! limit.

use crate::config::TcpConfig;
use crate::handler::{HandlerContext, handle_connection};
use crate::session::ConnectionId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

pub struct Listener {
    listener: TcpListener,
    ctx: HandlerContext,
    slots: Arc<Semaphore>,
}

impl Listener {
    /// Bind `cfg.listen_addr()` with the configured backlog.
    pub async fn bind(cfg: &TcpConfig, ctx: HandlerContext) -> Result<Self, ListenerError> {
        let addr = cfg.listen_addr();
        let bind_err = |source| ListenerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(cfg.backlog).map_err(bind_err)?;

        let ctx = ctx
            .with_idle_timeout(cfg.idle_timeout)
            .with_read_buffer(cfg.read_buffer_bytes);
        Ok(Listener {
            listener,
            ctx,
            slots: Arc::new(Semaphore::new(cfg.max_connections)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "tracker listener started");
        }
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer).await,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("tracker listener stopped");
    }

    async fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if self.ctx.guard.is_blocked(peer.ip()).await {
            info!(peer = %peer, "connection rejected: address blocked");
            return;
        }
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            warn!(peer = %peer, "connection rejected: at capacity");
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "set_nodelay failed");
        }

        let conn_id = ConnectionId::next();
        info!(conn_id = %conn_id, peer = %peer, "connection accepted");
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(stream, peer, conn_id, ctx).await;
        });
    }
}
