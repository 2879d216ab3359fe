// src/server/acceptor.rs

//! Listens on a TCP port and emits an accepted notification per inbound
//! socket, racing the accept against the shutdown signal.

use crate::connection::ClientConnection;
use crate::core::RelayError;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

/// Callback invoked synchronously for each accepted connection, before the
/// loop continues to the next accept.
pub type AcceptedHandler = Arc<dyn Fn(Arc<ClientConnection>) + Send + Sync>;

pub struct ClientAcceptor {
    listener: TcpListener,
    handlers: RwLock<Vec<AcceptedHandler>>,
    next_id: AtomicU64,
}

impl ClientAcceptor {
    pub async fn bind(host: &str, port: u16) -> Result<Self, RelayError> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// The actually-bound address (relevant when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn on_accepted(&self, handler: impl Fn(Arc<ClientConnection>) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// The accept loop. Cancellation wins over a pending accept and exits the
    /// loop cleanly; an accept-level error is fatal to the listener and
    /// propagated to the caller. There is no silent retry.
    pub async fn listen(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), RelayError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("acceptor received shutdown signal, no longer accepting");
                    return Ok(());
                }
                res = self.listener.accept() => {
                    let (socket, addr) = res?;
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let conn = Arc::new(ClientConnection::new(id, socket));
                    info!("accepted connection from {addr}");

                    let handlers = self.handlers.read().clone();
                    for handler in &handlers {
                        handler(conn.clone());
                    }
                }
            }
        }
    }
}
