//! Worker loops.
//!
//! A worker drains due tasks one at a time and, when the queue is empty,
//! waits on the wake channel for at most the poll interval before trying
//! again. Several workers may run in one process; each claims through the
//! store, so they never share a task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::engine::ExecutionEngine;
use crate::core::wake::WakeChannel;

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Timing knobs for a worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Longest wait between claim attempts when idle.
    pub poll_interval: Duration,
    /// Pause after a store error before claiming again.
    pub error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// Counters returned when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks claimed and recorded.
    pub processed: u64,
    /// Loop iterations that ended in a store error.
    pub errors: u64,
}

/// One sequential claim/execute loop.
pub struct Worker {
    id: String,
    engine: Arc<ExecutionEngine>,
    wake: Arc<dyn WakeChannel>,
    settings: WorkerSettings,
}

impl Worker {
    /// Worker with a fresh uuid identity.
    pub fn new(
        engine: Arc<ExecutionEngine>,
        wake: Arc<dyn WakeChannel>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            engine,
            wake,
            settings,
        }
    }

    /// Identity recorded in `claimed_by`.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` turns `true` or its sender is dropped.
    ///
    /// A task already claimed always runs to completion before the loop
    /// observes shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(worker = %self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.engine.run_once(&self.id).await {
                Ok(Some(_)) => {
                    stats.processed += 1;
                    continue;
                }
                Ok(None) => self.settings.poll_interval,
                Err(e) => {
                    stats.errors += 1;
                    if e.is_retryable() {
                        warn!(worker = %self.id, "store unavailable: {e}");
                    } else {
                        error!(worker = %self.id, "worker iteration failed: {e}");
                    }
                    self.settings.error_backoff
                }
            };
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                reason = self.wake.wait(pause) => {
                    debug!(worker = %self.id, ?reason, "worker woke");
                }
            }
        }
        info!(worker = %self.id, processed = stats.processed, "worker stopped");
        stats
    }
}

/// Handle used to stop a [`WorkerGroup`] and collect its stats.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
    done: Vec<oneshot::Receiver<WorkerStats>>,
    worker_ids: Vec<String>,
}

impl ShutdownHandle {
    /// Identities of the started workers.
    #[must_use]
    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Ask every worker to stop after its current task and wait for them.
    pub async fn shutdown(self) -> WorkerStats {
        // Receivers may already be gone if every worker exited.
        let _ = self.tx.send(true);
        let mut total = WorkerStats::default();
        for rx in self.done {
            if let Ok(stats) = rx.await {
                total.processed += stats.processed;
                total.errors += stats.errors;
            }
        }
        total
    }
}

/// `concurrency` workers sharing one engine and wake channel.
pub struct WorkerGroup {
    engine: Arc<ExecutionEngine>,
    wake: Arc<dyn WakeChannel>,
    settings: WorkerSettings,
    concurrency: usize,
}

impl WorkerGroup {
    /// Group of `concurrency` workers (at least one).
    pub fn new(
        engine: Arc<ExecutionEngine>,
        wake: Arc<dyn WakeChannel>,
        settings: WorkerSettings,
        concurrency: usize,
    ) -> Self {
        Self {
            engine,
            wake,
            settings,
            concurrency: concurrency.max(1),
        }
    }

    /// Number of loops the group starts.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Spawn every worker loop on `spawner`.
    pub fn start<S: Spawn>(&self, spawner: &S) -> ShutdownHandle {
        let (tx, rx) = watch::channel(false);
        let mut done = Vec::with_capacity(self.concurrency);
        let mut worker_ids = Vec::with_capacity(self.concurrency);
        for _ in 0..self.concurrency {
            let worker = Worker::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.wake),
                self.settings,
            );
            worker_ids.push(worker.id().to_string());
            let (stats_tx, stats_rx) = oneshot::channel();
            let shutdown = rx.clone();
            spawner.spawn(async move {
                let stats = worker.run(shutdown).await;
                let _ = stats_tx.send(stats);
            });
            done.push(stats_rx);
        }
        info!(workers = self.concurrency, "worker group started");
        ShutdownHandle {
            tx,
            done,
            worker_ids,
        }
    }
}
