// src/server/mod.rs

//! Server wiring and lifecycle: builds the pool, registry, manager, router,
//! and gateway, then runs the accept loop until a termination signal.

mod acceptor;

pub use acceptor::ClientAcceptor;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::core::RelayError;
use crate::core::gateway::CommandGateway;
use crate::core::pool::WorkerPool;
use crate::core::registry::ClientRegistry;
use crate::core::router::{self, BroadcastRouter};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Runs the relay until SIGINT/SIGTERM, then shuts down gracefully: stop
/// accepting, cancel read loops, drain in-flight pool work, exit.
pub async fn run(config: Config) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);

    let pool = WorkerPool::spawn(config.worker_threads, &shutdown_tx);
    let pool_handle = pool.handle();
    pool_handle.set_unhandled_error_handler(|e| match e {
        RelayError::Cancelled => {}
        e => warn!("unhandled error in pool job: {e}"),
    });

    let registry = Arc::new(ClientRegistry::new());
    let manager = ConnectionManager::new(registry, pool_handle, shutdown_tx.clone());

    let strategy = if config.gateway.enabled {
        info!(
            "command gateway enabled: {} {}",
            config.gateway.shell, config.gateway.template
        );
        let gateway = Arc::new(CommandGateway::new(
            &config.gateway.shell,
            &config.gateway.template,
        ));
        router::gateway_strategy(gateway, Duration::from_millis(config.gateway.timeout_ms))
    } else {
        router::unsupported_commands_strategy()
    };
    let _router = BroadcastRouter::attach(&manager, config.welcome_message.clone(), strategy);

    let acceptor = ClientAcceptor::bind(&config.host, config.port).await?;
    info!("Parlor relay listening on {}", acceptor.local_addr()?);
    {
        let manager = manager.clone();
        acceptor.on_accepted(move |conn| manager.on_accepted(conn));
    }

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {e}"))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {e}"))?;

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        biased;
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
        res = acceptor.listen(shutdown_tx.subscribe()) => {
            if let Err(e) = res {
                error!("accept loop failed: {e}");
                fatal = Some(e.into());
            }
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    let _ = shutdown_tx.send(());

    manager.shutdown().await;
    info!("All client connections closed.");

    if tokio::time::timeout(Duration::from_secs(10), pool.shutdown())
        .await
        .is_err()
    {
        warn!("Timed out waiting for the worker pool to finish cleanly.");
    }
    info!("Server shutdown complete.");

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
