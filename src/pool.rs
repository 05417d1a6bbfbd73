//! Worker pools
//!
//! One pool per queue, each a fixed number of tokio tasks that pull from the
//! [`QueueClient`] in a blocking loop and hand every delivery to a
//! [`DeliveryExecutor`]. Workers block only on the dequeue wait and on the
//! executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::queue::{Delivery, QueueClient};

/// How one delivery ended, from the worker's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Terminal success
    Succeeded,
    /// Terminal failure
    Failed,
    /// Another attempt was scheduled
    Retrying,
    /// Ended cancelled
    Cancelled,
    /// The lease was lost before the outcome could be recorded
    Discarded,
}

/// Runs one leased task to an outcome
#[async_trait]
pub trait DeliveryExecutor: Send + Sync + 'static {
    /// Execute the delivery and settle its lease
    async fn execute(&self, delivery: Delivery) -> ExecutionOutcome;
}

/// Worker pool counters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Queue the pool serves
    pub queue: String,
    /// Configured workers
    pub workers: usize,
    /// Workers executing a task right now
    pub active: usize,
    /// Deliveries that ended Succeeded
    pub completed: u64,
    /// Deliveries that ended Failed
    pub failed: u64,
    /// Deliveries that scheduled a retry
    pub retried: u64,
    /// `completed / (completed + failed)` as a percentage; 100 before any outcome
    pub success_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Fixed-size pool of workers for one queue
#[derive(Debug)]
pub struct WorkerPool {
    queue: String,
    workers: usize,
    counters: Arc<Counters>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` loops serving `queue_name` until `shutdown` fires
    pub fn spawn<E: DeliveryExecutor>(
        queue_name: &str,
        workers: usize,
        queue: Arc<QueueClient>,
        executor: Arc<E>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let handles = (0..workers)
            .map(|worker| {
                let ctx = WorkerLoop {
                    worker,
                    queues: vec![queue_name.to_string()],
                    queue: queue.clone(),
                    executor: executor.clone(),
                    counters: counters.clone(),
                    poll_interval,
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(ctx.run())
            })
            .collect();

        tracing::info!(queue = queue_name, workers, "Worker pool started");

        Self {
            queue: queue_name.to_string(),
            workers,
            counters,
            handles: Mutex::new(handles),
        }
    }

    /// Queue this pool serves
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let success_rate = if completed + failed == 0 {
            100.0
        } else {
            100.0 * completed as f64 / (completed + failed) as f64
        };
        PoolStats {
            queue: self.queue.clone(),
            workers: self.workers,
            active: self.counters.active.load(Ordering::Relaxed),
            completed,
            failed,
            retried: self.counters.retried.load(Ordering::Relaxed),
            success_rate,
        }
    }

    /// Wait for every worker to exit. Only the first call waits.
    pub async fn join(&self) {
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(queue = %self.queue, error = %e, "Worker task panicked");
            }
        }
    }
}

struct WorkerLoop<E> {
    worker: usize,
    queues: Vec<String>,
    queue: Arc<QueueClient>,
    executor: Arc<E>,
    counters: Arc<Counters>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl<E: DeliveryExecutor> WorkerLoop<E> {
    async fn run(self) {
        loop {
            let deliveries = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                deliveries = self.queue.dequeue(&self.queues, 1, self.poll_interval) => deliveries,
            };

            for delivery in deliveries {
                if self.shutdown.is_cancelled() {
                    // hand it back untouched; no retry is consumed
                    self.queue.nack(
                        delivery.task_id,
                        delivery.tag,
                        true,
                        TaskError::worker_lost("worker stopped before running the task"),
                    );
                    continue;
                }

                tracing::debug!(
                    queue = %delivery.queue,
                    worker = self.worker,
                    task_id = %delivery.task_id,
                    "Worker picked up task"
                );

                self.counters.active.fetch_add(1, Ordering::SeqCst);
                let outcome = self.executor.execute(delivery).await;
                self.counters.active.fetch_sub(1, Ordering::SeqCst);

                match outcome {
                    ExecutionOutcome::Succeeded => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    ExecutionOutcome::Failed => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    ExecutionOutcome::Retrying => {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    ExecutionOutcome::Cancelled | ExecutionOutcome::Discarded => {}
                }
            }
        }

        tracing::debug!(queue = ?self.queues, worker = self.worker, "Worker stopped");
    }
}
