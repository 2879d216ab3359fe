// src/core/pool.rs

//! A fixed-size worker pool draining one shared FIFO job queue.
//!
//! All event-handler and broadcast continuations are posted here, which gives
//! them a single consistent execution context with a concurrency ceiling equal
//! to the worker count, independent of how many clients are connected. A job
//! that fails or panics is caught at the pool boundary and forwarded to the
//! registered unhandled-error handler by posting the notification back onto
//! the pool; the worker itself keeps running.

use crate::core::RelayError;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// A unit of work for the pool.
pub type Job = BoxFuture<'static, Result<(), RelayError>>;

/// Callback invoked (on a pool worker) for every job failure.
pub type UnhandledErrorHandler = Arc<dyn Fn(RelayError) + Send + Sync>;

type SharedQueue = Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>;

/// Cloneable handle for posting work onto the pool.
#[derive(Clone)]
pub struct PoolHandle {
    queue_tx: mpsc::UnboundedSender<Job>,
    queue_len: Arc<AtomicUsize>,
    on_unhandled: Arc<RwLock<Option<UnhandledErrorHandler>>>,
}

impl PoolHandle {
    /// Enqueues a job. Never blocks the caller. Posting after shutdown is
    /// accepted and the job is quietly dropped with the closing queue;
    /// refusing posts at shutdown would only create races for callers.
    pub fn post(&self, job: impl Future<Output = Result<(), RelayError>> + Send + 'static) {
        self.queue_len.fetch_add(1, Ordering::Relaxed);
        if self.queue_tx.send(job.boxed()).is_err() {
            self.queue_len.fetch_sub(1, Ordering::Relaxed);
            debug!("worker pool is shut down, dropping posted job");
        }
    }

    /// Number of jobs queued and not yet picked up by a worker.
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// Installs the handler notified of job failures. Replaces any previous one.
    pub fn set_unhandled_error_handler(&self, handler: impl Fn(RelayError) + Send + Sync + 'static) {
        *self.on_unhandled.write() = Some(Arc::new(handler));
    }

    /// Forwards a failure to the unhandled-error handler. The notification is
    /// itself a pool job, so it runs on a worker like any other continuation
    /// instead of synchronously on the faulting path.
    fn report_unhandled(&self, err: RelayError) {
        let on_unhandled = self.on_unhandled.clone();
        self.post(async move {
            if let Some(handler) = on_unhandled.read().clone() {
                handler(err);
            }
            Ok(())
        });
    }
}

/// The pool itself: owns the worker tasks. Dropping it aborts the workers, so
/// the server keeps it alive until the end of shutdown.
pub struct WorkerPool {
    handle: PoolHandle,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawns `worker_count` long-lived workers (at least one) sharing one
    /// FIFO queue. Workers poll the shutdown broadcast between queue pops.
    pub fn spawn(worker_count: usize, shutdown_tx: &broadcast::Sender<()>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_rx: SharedQueue = Arc::new(AsyncMutex::new(queue_rx));

        let handle = PoolHandle {
            queue_tx,
            queue_len: Arc::new(AtomicUsize::new(0)),
            on_unhandled: Arc::new(RwLock::new(None)),
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count.max(1) {
            let queue_rx = queue_rx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let handle = handle.clone();
            workers.spawn(worker_loop(worker_id, queue_rx, shutdown_rx, handle));
        }

        Self { handle, workers }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Waits for every worker to observe the shutdown signal and exit. A job
    /// already dequeued still runs to completion first.
    pub async fn shutdown(mut self) {
        while self.workers.join_next().await.is_some() {}
        debug!("worker pool shut down");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue_rx: SharedQueue,
    mut shutdown_rx: broadcast::Receiver<()>,
    handle: PoolHandle,
) {
    loop {
        // Only one worker waits on the queue at a time; the lock is released
        // before the job runs, so execution itself is parallel.
        let job = {
            let mut queue = queue_rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!("pool worker {worker_id} received shutdown signal, stopping");
                    return;
                }
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => return,
                },
            }
        };
        handle.queue_len.fetch_sub(1, Ordering::Relaxed);

        trace!("pool worker {worker_id} picked up a job");
        match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => handle.report_unhandled(e),
            Err(panic) => handle.report_unhandled(RelayError::Internal(format!(
                "pool job panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
