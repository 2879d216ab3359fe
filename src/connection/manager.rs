// src/connection/manager.rs

//! The `ConnectionManager` owns the client registry, drives one read loop and
//! one outbound loop per connection, and emits the connected/disconnected/
//! incoming notifications.

use crate::connection::ClientConnection;
use crate::core::RelayError;
use crate::core::events::EventSource;
use crate::core::pool::PoolHandle;
use crate::core::protocol::Message;
use crate::core::registry::ClientRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Ephemeral event payload for a message read off a client connection.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender: Arc<ClientConnection>,
    pub message: Message,
}

pub struct ConnectionManager {
    registry: Arc<ClientRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    /// Read and outbound loops for every connection, reaped opportunistically
    /// on accept and drained fully at shutdown.
    connection_tasks: Mutex<JoinSet<()>>,
    pub client_connected: EventSource<Arc<ClientConnection>>,
    pub client_disconnected: EventSource<Arc<ClientConnection>>,
    pub incoming_message: EventSource<IncomingMessage>,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        pool: PoolHandle,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            shutdown_tx,
            connection_tasks: Mutex::new(JoinSet::new()),
            client_connected: EventSource::new(pool.clone()),
            client_disconnected: EventSource::new(pool.clone()),
            incoming_message: EventSource::new(pool),
        })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Entry point wired to the acceptor's accepted notification: registers
    /// the connection, fires `ClientConnected`, and starts its read and
    /// outbound loops.
    pub fn on_accepted(self: &Arc<Self>, conn: Arc<ClientConnection>) {
        self.registry.insert(conn.clone());
        debug!("{conn} connected");
        self.client_connected.emit(conn.clone());

        let manager = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = self.connection_tasks.lock();
        // Loops of connections long gone are reaped here; the set holds live
        // tasks only, not one entry per connection ever accepted.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(manager.read_loop(conn.clone(), shutdown_rx));
        tasks.spawn(conn.run_outbound());
    }

    /// Number of connection tasks currently tracked, finished but not yet
    /// reaped ones included.
    pub fn task_count(&self) -> usize {
        self.connection_tasks.lock().len()
    }

    /// Runs until the connection dies or shutdown is signaled. Each client's
    /// loop is an independent task; a stalled client never blocks the others.
    async fn read_loop(
        self: Arc<Self>,
        conn: Arc<ClientConnection>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        // The guard fires the registry removal and `ClientDisconnected`
        // exactly once, whichever path ends the loop.
        let _guard = ReadLoopGuard {
            manager: self.clone(),
            conn: conn.clone(),
        };

        match self.read_client_messages(&conn, &mut shutdown_rx).await {
            RelayError::Cancelled => debug!("{conn} read loop cancelled"),
            e if e.is_clean_disconnect() => debug!("{conn} disconnected ({e})"),
            e => warn!("{conn} disconnected with error: {e}"),
        }

        conn.disconnect().await;
    }

    /// Strictly sequential reads for one connection. Returns the failure that
    /// ended the loop.
    async fn read_client_messages(
        &self,
        conn: &Arc<ClientConnection>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> RelayError {
        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return RelayError::Cancelled,
                res = conn.read_message() => match res {
                    Ok(message) => message,
                    Err(e) => return e,
                },
            };
            conn.set_last_username(&message.sender);
            self.incoming_message.emit(IncomingMessage {
                sender: conn.clone(),
                message,
            });
        }
    }

    /// Disconnects every registered client and drains the connection tasks.
    /// Called after the global shutdown broadcast has fired.
    pub async fn shutdown(&self) {
        for conn in self.registry.snapshot().values() {
            conn.disconnect().await;
        }
        let mut tasks = std::mem::take(&mut *self.connection_tasks.lock());
        while tasks.join_next().await.is_some() {}
        debug!("all connection tasks drained");
    }
}

/// RAII cleanup for one read loop: removes the connection from the registry
/// and fires `ClientDisconnected`. The registry remove yields the connection
/// only once, so the notification cannot double-fire on racing completions,
/// and a panicking loop still cleans up.
struct ReadLoopGuard {
    manager: Arc<ConnectionManager>,
    conn: Arc<ClientConnection>,
}

impl Drop for ReadLoopGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.manager.registry.remove(self.conn.id()) {
            self.manager.client_disconnected.emit(conn.clone());
            // Socket teardown is async; hand it to the runtime.
            tokio::spawn(async move { conn.disconnect().await });
        }
    }
}
