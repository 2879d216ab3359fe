// src/core/router.rs

//! The broadcast router: consumes the connection manager's notifications,
//! fans messages out to all clients, and routes slash-prefixed input to a
//! pluggable incoming-command strategy.

use crate::connection::{ClientConnection, ConnectionManager, IncomingMessage};
use crate::core::RelayError;
use crate::core::gateway::CommandGateway;
use crate::core::protocol::Message;
use crate::core::registry::ClientRegistry;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Decides what happens to slash-prefixed input. Injected at construction,
/// never swapped at runtime. Receives the trimmed message text (still
/// carrying the leading `/`) and the originating connection.
pub type IncomingCommandStrategy =
    Arc<dyn Fn(Arc<ClientConnection>, String) -> BoxFuture<'static, Result<(), RelayError>> + Send + Sync>;

pub struct BroadcastRouter {
    registry: Arc<ClientRegistry>,
    welcome_message: String,
    strategy: IncomingCommandStrategy,
}

impl BroadcastRouter {
    /// Builds the router and subscribes it to the manager's three events.
    /// Handlers run as pool jobs, so their failures are caught at the pool
    /// boundary and never crash the dispatching worker.
    pub fn attach(
        manager: &ConnectionManager,
        welcome_message: String,
        strategy: IncomingCommandStrategy,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            registry: manager.registry().clone(),
            welcome_message,
            strategy,
        });

        manager.client_connected.subscribe({
            let router = router.clone();
            move |conn| {
                let router = router.clone();
                Box::pin(async move { router.handle_connected(conn).await })
            }
        });
        manager.client_disconnected.subscribe({
            let router = router.clone();
            move |conn| {
                let router = router.clone();
                Box::pin(async move { router.handle_disconnected(conn).await })
            }
        });
        manager.incoming_message.subscribe({
            let router = router.clone();
            move |incoming| {
                let router = router.clone();
                Box::pin(async move { router.handle_incoming(incoming).await })
            }
        });

        router
    }

    async fn handle_connected(&self, conn: Arc<ClientConnection>) -> Result<(), RelayError> {
        self.broadcast(&Message::system(format!("{conn} connected")));
        // The welcome is a private reply; it must not reach the other clients.
        // Posting onto the same queue as the notice keeps the two in order.
        if let Err(e) = conn.post_message(Message::system(self.welcome_message.clone())) {
            warn!("failed to queue welcome for {conn}: {e}");
        }
        Ok(())
    }

    async fn handle_disconnected(&self, conn: Arc<ClientConnection>) -> Result<(), RelayError> {
        self.broadcast(&Message::system(format!("{conn} disconnected")));
        Ok(())
    }

    async fn handle_incoming(&self, incoming: IncomingMessage) -> Result<(), RelayError> {
        let trimmed = incoming.message.text.trim_start();
        if trimmed.starts_with('/') {
            let command = trimmed.to_string();
            (self.strategy)(incoming.sender.clone(), command).await
        } else {
            self.broadcast(&incoming.message);
            Ok(())
        }
    }

    /// Fans one message out to every client in the current registry snapshot,
    /// including the sender, by posting onto each recipient's outbound queue.
    /// The fan-out itself never touches a socket, so a dead or stalled
    /// recipient cannot delay delivery to the others or pin the pool worker
    /// running this handler.
    fn broadcast(&self, message: &Message) {
        for client in self.registry.snapshot().values() {
            if let Err(e) = client.post_message(message.clone()) {
                warn!("failed to queue message for {client}: {e}");
            }
        }
    }
}

/// The default strategy when no command gateway is configured: a single
/// private reply to the sender, no broadcast.
pub fn unsupported_commands_strategy() -> IncomingCommandStrategy {
    Arc::new(|sender, _command| {
        Box::pin(async move {
            sender.post_message(Message::system("Commands are not supported yet"))
        })
    })
}

/// Routes slash commands to the gateway and replies privately to the sender
/// with the captured output, or with a notice when the gateway is busy, the
/// command times out, or it fails.
pub fn gateway_strategy(gateway: Arc<CommandGateway>, timeout: Duration) -> IncomingCommandStrategy {
    Arc::new(move |sender, command| {
        let gateway = gateway.clone();
        Box::pin(async move {
            let command_line = command.trim_start_matches('/').trim().to_string();
            let reply = match gateway.try_start_executing(&command_line, timeout) {
                Err(RelayError::CommandRefused) => "Another command is already running".to_string(),
                Err(e) => return Err(e),
                Ok(execution) => match execution.await {
                    Ok(output) => output,
                    Err(e @ (RelayError::TimedOut | RelayError::CommandFailed(_))) => e.to_string(),
                    Err(e) => return Err(e),
                },
            };
            sender.post_message(Message::system(reply))
        })
    })
}
