// src/core/events.rs

//! Explicit event-subscription wiring: components expose an `EventSource` per
//! notification and collaborators register handler closures on it.

use crate::core::RelayError;
use crate::core::pool::PoolHandle;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;

/// A registered event handler. The emitter expects no return value; the
/// `Result` only feeds the pool's unhandled-error reporting.
pub type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), RelayError>> + Send + Sync>;

/// A subscribable notification source. Each emit schedules one pool job per
/// handler, so handler code runs on the worker pool with bounded parallelism,
/// and a failing handler is reported through the pool's unhandled-error
/// channel without ever crashing the emitter or unregistering the handler.
pub struct EventSource<T> {
    handlers: RwLock<Vec<Handler<T>>>,
    pool: PoolHandle,
}

impl<T: Clone + Send + 'static> EventSource<T> {
    pub fn new(pool: PoolHandle) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            pool,
        }
    }

    /// Registers a handler. Handlers are never unregistered for the lifetime
    /// of the source.
    pub fn subscribe(
        &self,
        handler: impl Fn(T) -> BoxFuture<'static, Result<(), RelayError>> + Send + Sync + 'static,
    ) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Fires the event: posts one job per registered handler. Returns
    /// immediately; the handlers themselves resume on pool workers.
    pub fn emit(&self, payload: T) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            let payload = payload.clone();
            self.pool.post(async move { handler(payload).await });
        }
    }
}
