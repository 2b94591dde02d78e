//! Unit-of-work delivery
//!
//! Fan-out deliveries and routed inbound messages are handed to a [`Dispatch`]
//! strategy. `deliver` never blocks the caller, so a publisher is never held
//! up by a slow subscriber regardless of the strategy.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// A boxed unit of work
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Strategy for running units of work
pub trait Dispatch: Send + Sync {
    fn deliver(&self, work: Work);
}

/// One tokio task per unit of work
#[derive(Debug, Default, Clone, Copy)]
pub struct Spawn;

impl Dispatch for Spawn {
    fn deliver(&self, work: Work) {
        tokio::spawn(work);
    }
}

/// Fixed set of workers draining a shared queue
///
/// Caps how many units run at once. The queue itself is unbounded.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Work>,
    workers: usize,
}

impl WorkerPool {
    /// Start `workers` worker tasks (at least one)
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (queue, rx) = mpsc::unbounded_channel::<Work>();
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(work) => work.await,
                        None => break,
                    }
                }
                debug!(worker, "dispatch worker stopped");
            });
        }

        Self { queue, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Dispatch for WorkerPool {
    fn deliver(&self, work: Work) {
        if self.queue.send(work).is_err() {
            warn!("dispatch workers stopped, dropping unit of work");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}

/// Pick a strategy: a worker pool when a size is configured, else [`Spawn`]
pub fn from_workers(workers: Option<usize>) -> Arc<dyn Dispatch> {
    match workers {
        Some(n) if n > 0 => Arc::new(WorkerPool::new(n)),
        _ => Arc::new(Spawn),
    }
}
