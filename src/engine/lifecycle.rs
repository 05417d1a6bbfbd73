//! Startup and shutdown coordination.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::queue::Reclaimed;
use crate::types::Event;

use super::{Engine, lock};

impl Engine {
    /// Spawn one worker pool per configured queue and the lease reaper
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the engine was already started, and
    /// [`Error::ShuttingDown`] after [`Engine::shutdown`].
    pub fn start(&self) -> Result<()> {
        self.ensure_accepting()?;
        if self.runtime.started.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("engine", "start", "running"));
        }

        let executor = Arc::new(self.clone());
        let pools: Vec<Arc<WorkerPool>> = self
            .config
            .queues
            .iter()
            .map(|q| {
                Arc::new(WorkerPool::spawn(
                    &q.name,
                    q.concurrency,
                    self.queue.clone(),
                    executor.clone(),
                    self.config.execution.poll_interval,
                    self.runtime.shutdown.child_token(),
                ))
            })
            .collect();
        lock(&self.runtime.pools).extend(pools);

        let reaper = self.clone();
        let handle = tokio::spawn(async move { reaper.run_reaper().await });
        lock(&self.runtime.background).push(handle);

        tracing::info!(queues = self.config.queues.len(), "Engine started");
        Ok(())
    }

    async fn run_reaper(self) {
        let mut interval = tokio::time::interval(self.config.execution.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.runtime.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.reap_expired_leases();
                }
            }
        }
        tracing::debug!("Lease reaper stopped");
    }

    /// Redeliver every task whose lease expired; returns how many were reclaimed
    pub(crate) fn reap_expired_leases(&self) -> usize {
        let reclaimed = self.queue.reclaim_expired();
        for entry in &reclaimed {
            match *entry {
                Reclaimed::Requeued { id, tag } => {
                    // signal the handler that outlived its lease, never a redelivered copy
                    if let Some((_, token)) = lock(&self.runtime.active)
                        .get(&id)
                        .filter(|(active_tag, _)| *active_tag == tag)
                    {
                        token.cancel();
                    }
                    self.emit_event(Event::WorkerLost { id });
                }
                Reclaimed::Cancelled(id) => {
                    tracing::info!(task_id = %id, "Lease expired on a cancelled task");
                    self.emit_event(Event::TaskCancelled { id });
                    self.on_task_terminal(id);
                }
            }
        }
        reclaimed.len()
    }

    /// Gracefully shut down the engine
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new submissions
    /// 2. Signals workers, the reaper and batch coordinators to stop
    /// 3. Waits up to `execution.shutdown_timeout` for in-flight tasks to finish
    /// 4. Signals handlers still running after the timeout through their tokens
    ///
    /// Tasks that were queued but not started stay in their queues.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new work
        self.runtime.accepting_new.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new submissions");

        // 2. Stop pulling work
        self.runtime.shutdown.cancel();

        // 3. Wait for in-flight executions
        let pools: Vec<Arc<WorkerPool>> = lock(&self.runtime.pools).clone();
        let background = std::mem::take(&mut *lock(&self.runtime.background));
        let wait = async {
            for pool in &pools {
                pool.join().await;
            }
            for handle in background {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Background task panicked");
                }
            }
        };

        let timeout = self.config.execution.shutdown_timeout;
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => tracing::info!("All workers stopped"),
            Err(_) => {
                // 4. Last resort: ask remaining handlers to abort
                let active = lock(&self.runtime.active);
                tracing::warn!(
                    active_count = active.len(),
                    "Timeout waiting for workers, cancelling remaining tasks"
                );
                for (_, token) in active.values() {
                    token.cancel();
                }
            }
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
