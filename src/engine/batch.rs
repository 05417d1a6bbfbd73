//! Batch coordinators.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchJob, BatchRequest};
use crate::task::ParentRef;
use crate::types::BatchId;

use super::{Engine, lock};

impl Engine {
    /// Schedule every item of a batch with at most `limit` in flight
    ///
    /// Each scheduled item holds one semaphore permit until its task reaches a
    /// terminal status (see `finish_task`), so retries keep their slot.
    pub(crate) async fn run_batch(
        self,
        id: BatchId,
        request: BatchRequest,
        limit: usize,
        token: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(limit));
        if self.records.batches.update(id, BatchJob::start) != Some(true) {
            return;
        }
        tracing::debug!(batch_id = %id, "Batch coordinator started");

        for index in 0..request.items.len() {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(item) = request.item_request(id, index) else {
                break;
            };
            let task_id = self.records.ids.next_task();
            let claimed = self
                .records
                .batches
                .update(id, |b| b.begin_item(index, task_id))
                .unwrap_or(false);
            if !claimed {
                break;
            }

            // registered before enqueue; a fast item may finish immediately
            lock(&self.runtime.batch_permits).insert(task_id, permit);
            let parent = ParentRef::Batch { id, index };
            if let Err(e) = self.enqueue_request(task_id, &item, None, Some(parent)) {
                tracing::error!(batch_id = %id, index, error = %e, "Failed to schedule batch item");
                lock(&self.runtime.batch_permits).remove(&task_id);
                self.records.batches.update(id, |b| {
                    b.fail(format!("item {} could not be scheduled: {}", index, e))
                });
                self.batch_finished(id);
                return;
            }
        }

        let cancelled = self
            .records
            .batches
            .get(id)
            .is_some_and(|b| b.cancel_requested);
        if self.runtime.shutdown.is_cancelled() && !cancelled {
            tracing::info!(batch_id = %id, "Engine shutting down, batch left unfinished");
            return;
        }

        // every permit back means nothing is in flight
        let drained = tokio::select! {
            biased;
            _ = self.runtime.shutdown.cancelled() => false,
            all = semaphore.acquire_many(limit as u32) => all.is_ok(),
        };
        if !drained {
            tracing::info!(batch_id = %id, "Engine shutting down, batch left unfinished");
            return;
        }

        if self
            .records
            .batches
            .update(id, BatchJob::finalize)
            .flatten()
            .is_some()
        {
            self.batch_finished(id);
        }
    }
}
