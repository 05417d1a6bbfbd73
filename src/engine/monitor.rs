//! Status queries, cancellation and manual retry.

use crate::batch::BatchJob;
use crate::composer::WorkflowSnapshot;
use crate::db::TaskHistoryEntry;
use crate::error::{Error, Result};
use crate::pool::PoolStats;
use crate::progress::ProgressUpdate;
use crate::queue::QueueStats;
use crate::task::Task;
use crate::types::{BatchId, BatchStatus, Event, TaskId, TaskStatus, WorkflowId, WorkflowStatus};

use super::{Engine, lock};

impl Engine {
    /// Snapshot of a task record
    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        self.records
            .tasks
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Aggregated view of a workflow with per-step detail
    ///
    /// Member statuses are read live from the task records, so a step shows
    /// Running or Retrying while its task does.
    pub fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowSnapshot> {
        let state = self
            .records
            .workflows
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(state.snapshot(|task| self.records.tasks.get(task).map(|t| t.status)))
    }

    /// Snapshot of a batch and its per-item outcomes
    pub fn get_batch(&self, id: BatchId) -> Result<BatchJob> {
        self.records
            .batches
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Tasks, optionally restricted to one status, in submission order
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let mut tasks = self
            .records
            .tasks
            .filter(|t| status.is_none_or(|s| t.status == s));
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Batches submitted on behalf of `user_ref`, oldest first
    pub fn batches_for_user(&self, user_ref: &str) -> Vec<BatchJob> {
        let mut batches = self
            .records
            .batches
            .filter(|b| b.user_ref.as_deref() == Some(user_ref));
        batches.sort_by_key(|b| b.id);
        batches
    }

    /// Latest progress reported by a running task
    pub fn task_progress(&self, id: TaskId) -> Option<ProgressUpdate> {
        self.progress.get(id)
    }

    /// Ready, delayed and leased counts per queue
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.queue.stats()
    }

    /// Counters of every worker pool (empty before [`Engine::start`])
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        lock(&self.runtime.pools).iter().map(|p| p.stats()).collect()
    }

    /// Cancel a task
    ///
    /// A task that has not started is Cancelled immediately. A running task is
    /// marked so it will not retry; a `hard` cancel additionally signals its
    /// handler through the context's cancellation token. Cancelling a terminal
    /// task is a no-op.
    ///
    /// Returns the task's status after the call: the terminal status, or
    /// Running while a cancel is pending.
    pub fn cancel(&self, id: TaskId, hard: bool) -> Result<TaskStatus> {
        let (status, transitioned) = self.cancel_task_record(id, hard)?;
        if transitioned {
            self.on_task_terminal(id);
        }
        Ok(status)
    }

    /// Cancel without propagating to the parent; true in the second slot when
    /// the task became Cancelled by this call
    pub(crate) fn cancel_task_record(&self, id: TaskId, hard: bool) -> Result<(TaskStatus, bool)> {
        let (status, transitioned) = self
            .records
            .tasks
            .update(id, |t| {
                if t.status.is_terminal() {
                    return Ok((t.status, false));
                }
                if t.status == TaskStatus::Running {
                    t.cancel_requested = true;
                    return Ok((t.status, false));
                }
                t.cancel_requested = true;
                t.cancel().map(|_| (TaskStatus::Cancelled, true))
            })
            .ok_or_else(|| Error::NotFound(id.to_string()))??;

        if transitioned {
            self.queue.remove(id);
            tracing::info!(task_id = %id, "Task cancelled");
            self.emit_event(Event::TaskCancelled { id });
        } else if status == TaskStatus::Running {
            tracing::info!(task_id = %id, hard, "Cancel requested for running task");
            if hard && let Some((_, token)) = lock(&self.runtime.active).get(&id) {
                token.cancel();
            }
        }
        Ok((status, transitioned))
    }

    /// Resubmit a terminally Failed task as a new task at attempt 0
    ///
    /// The old record keeps its status and points at the new one through
    /// `superseded_by`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the task is Failed and has not been
    /// retried before.
    pub fn retry(&self, id: TaskId) -> Result<TaskId> {
        self.ensure_accepting()?;
        let new_id = self.records.ids.next_task();
        let fresh = self
            .records
            .tasks
            .update(id, |t| {
                if t.status != TaskStatus::Failed {
                    return Err(Error::invalid_state(id, "retry", t.status));
                }
                if let Some(next) = t.superseded_by {
                    return Err(Error::invalid_state(
                        id,
                        "retry",
                        format!("failed (already retried as {})", next),
                    ));
                }
                t.superseded_by = Some(new_id);
                Ok(t.resubmission(new_id))
            })
            .ok_or_else(|| Error::NotFound(id.to_string()))??;

        let (kind, queue) = (fresh.kind, fresh.queue.clone());
        self.emit_event(Event::TaskQueued {
            id: new_id,
            kind,
            queue: queue.clone(),
        });
        self.queue.enqueue(fresh, None)?;

        tracing::info!(task_id = %id, new_task_id = %new_id, queue = %queue, "Failed task resubmitted");
        Ok(new_id)
    }

    /// Cancel every unfinished member of a workflow
    ///
    /// Members that never started are dropped; running members are hard
    /// cancelled and the workflow finishes once they report back.
    pub fn cancel_workflow(&self, id: WorkflowId) -> Result<WorkflowStatus> {
        let actions = self
            .records
            .workflows
            .update(id, |w| w.cancel())
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        tracing::info!(workflow_id = %id, "Workflow cancel requested");
        self.apply_workflow_actions(id, actions);
        Ok(self.get_workflow(id)?.status)
    }

    /// Stop scheduling new items of a batch
    ///
    /// Items already handed to the queue run to completion; the batch ends
    /// Cancelled once they have. No-op for a terminal batch.
    pub fn cancel_batch(&self, id: BatchId) -> Result<BatchStatus> {
        let (requested, status) = self
            .records
            .batches
            .update(id, |b| (b.request_cancel(), b.status))
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if requested {
            tracing::info!(batch_id = %id, "Batch cancel requested");
            if let Some(token) = lock(&self.runtime.batch_tokens).get(&id) {
                token.cancel();
            }
        }
        Ok(status)
    }

    /// Latest archived record of a task
    pub async fn task_history(&self, id: TaskId) -> Result<Option<TaskHistoryEntry>> {
        self.history_db()?.get_task_history(id.get()).await
    }

    /// Archived tasks, most recently finished first
    pub async fn query_history(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TaskHistoryEntry>> {
        self.history_db()?
            .query_history(status.map(|s| s.to_i32()), limit, offset)
            .await
    }

    /// Number of archived tasks, optionally with one status
    pub async fn count_history(&self, status: Option<TaskStatus>) -> Result<i64> {
        self.history_db()?
            .count_history(status.map(|s| s.to_i32()))
            .await
    }

    fn history_db(&self) -> Result<&crate::db::Database> {
        self.db.as_deref().ok_or_else(|| Error::Config {
            message: "task history is not enabled".to_string(),
            key: Some("persistence.database_path".to_string()),
        })
    }
}
