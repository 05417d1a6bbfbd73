//! Propagation of terminal task outcomes.
//!
//! A task reaching a terminal status can advance its workflow, which may
//! enqueue or cancel other tasks, which may finish further nodes. The cascade
//! runs as a worklist instead of recursion so each store update stays a
//! single short critical section.

use std::collections::VecDeque;

use crate::composer::WorkflowAction;
use crate::config::WebhookEvent;
use crate::db::NewTaskHistory;
use crate::error::TaskError;
use crate::task::{ParentRef, Task};
use crate::types::{BatchId, BatchStatus, Event, TaskId, TaskStatus, WebhookPayload, WorkflowId, WorkflowStatus};

use super::webhooks::HookTarget;
use super::{Engine, lock};

enum Cascade {
    Task(TaskId),
    Workflow(WorkflowId, Vec<WorkflowAction>),
}

impl Engine {
    /// Bookkeeping for a task that just reached a terminal status
    pub(crate) fn on_task_terminal(&self, id: TaskId) {
        self.run_cascade(VecDeque::from([Cascade::Task(id)]));
    }

    /// Carry out actions produced by a workflow state change
    pub(crate) fn apply_workflow_actions(&self, workflow: WorkflowId, actions: Vec<WorkflowAction>) {
        if !actions.is_empty() {
            self.run_cascade(VecDeque::from([Cascade::Workflow(workflow, actions)]));
        }
    }

    fn run_cascade(&self, mut work: VecDeque<Cascade>) {
        while let Some(item) = work.pop_front() {
            match item {
                Cascade::Task(id) => self.finish_task(id, &mut work),
                Cascade::Workflow(workflow, actions) => {
                    for action in actions {
                        self.apply_action(workflow, action, &mut work);
                    }
                }
            }
        }
    }

    fn finish_task(&self, id: TaskId, work: &mut VecDeque<Cascade>) {
        let Some(task) = self.records.tasks.get(id) else {
            return;
        };
        if !task.status.is_terminal() {
            return;
        }

        self.progress.clear(id);
        self.archive(&task);

        match task.parent {
            Some(ParentRef::Workflow { id: workflow, node }) => {
                let actions = self
                    .records
                    .workflows
                    .update(workflow, |w| {
                        w.complete_task(
                            node,
                            task.id,
                            task.status,
                            task.result.clone(),
                            task.error.clone(),
                            &self.records.ids,
                        )
                    })
                    .unwrap_or_default();
                if !actions.is_empty() {
                    work.push_back(Cascade::Workflow(workflow, actions));
                }
            }
            Some(ParentRef::Batch { id: batch, index }) => {
                self.records.batches.update(batch, |b| {
                    b.record(index, task.status, task.result.clone(), task.error.clone())
                });
                // frees a slot for the coordinator
                lock(&self.runtime.batch_permits).remove(&task.id);
            }
            None => {}
        }
    }

    fn apply_action(&self, workflow: WorkflowId, action: WorkflowAction, work: &mut VecDeque<Cascade>) {
        match action {
            WorkflowAction::Enqueue {
                node,
                task_id,
                request,
            } => {
                let parent = ParentRef::Workflow { id: workflow, node };
                if let Err(e) = self.enqueue_request(task_id, &request, None, Some(parent)) {
                    tracing::error!(
                        workflow_id = %workflow,
                        task_id = %task_id,
                        error = %e,
                        "Failed to enqueue workflow member"
                    );
                    let actions = self
                        .records
                        .workflows
                        .update(workflow, |w| {
                            w.complete_task(
                                node,
                                task_id,
                                TaskStatus::Failed,
                                None,
                                Some(TaskError::permanent(e.to_string())),
                                &self.records.ids,
                            )
                        })
                        .unwrap_or_default();
                    if !actions.is_empty() {
                        work.push_back(Cascade::Workflow(workflow, actions));
                    }
                }
            }
            WorkflowAction::Cancel(task_id) => match self.cancel_task_record(task_id, true) {
                Ok((_, true)) => work.push_back(Cascade::Task(task_id)),
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to cancel workflow member");
                }
            },
            WorkflowAction::Finished(status) => self.workflow_finished(workflow, status),
        }
    }

    fn workflow_finished(&self, id: WorkflowId, status: WorkflowStatus) {
        match status {
            WorkflowStatus::Succeeded => tracing::info!(workflow_id = %id, "Workflow succeeded"),
            _ => tracing::warn!(workflow_id = %id, status = %status, "Workflow finished"),
        }
        self.emit_event(Event::WorkflowFinished { id, status });

        let Ok(snapshot) = self.get_workflow(id) else {
            return;
        };
        let succeeded = status == WorkflowStatus::Succeeded;
        let payload = WebhookPayload {
            event: if succeeded { "workflow_complete" } else { "workflow_failed" }.to_string(),
            target: "workflow".to_string(),
            id: id.get(),
            status: status.as_str().to_string(),
            progress_percent: snapshot.progress_percent,
            succeeded_count: None,
            failed_count: None,
            success_rate: None,
            result: snapshot.result,
            error: snapshot.error.map(|e| e.message),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let event = if succeeded {
            WebhookEvent::OnWorkflowComplete
        } else {
            WebhookEvent::OnWorkflowFailed
        };
        self.notify_completion(HookTarget::Workflow(id), event, payload);
    }

    /// Events, hooks and cleanup for a batch that reached a terminal status
    pub(crate) fn batch_finished(&self, id: BatchId) {
        lock(&self.runtime.batch_tokens).remove(&id);
        let Some(batch) = self.records.batches.get(id) else {
            return;
        };

        tracing::info!(
            batch_id = %id,
            status = %batch.status,
            succeeded = batch.succeeded_count,
            failed = batch.failed_count,
            success_rate = batch.success_rate(),
            "Batch finished"
        );
        self.emit_event(Event::BatchFinished {
            id,
            status: batch.status,
            succeeded: batch.succeeded_count,
            failed: batch.failed_count,
        });

        let completed = batch.status == BatchStatus::Completed;
        let payload = WebhookPayload {
            event: if completed { "batch_complete" } else { "batch_failed" }.to_string(),
            target: "batch".to_string(),
            id: id.get(),
            status: batch.status.as_str().to_string(),
            progress_percent: batch.progress_percent(),
            succeeded_count: Some(batch.succeeded_count),
            failed_count: Some(batch.failed_count),
            success_rate: Some(batch.success_rate()),
            result: None,
            error: batch.error.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let event = if completed {
            WebhookEvent::OnBatchComplete
        } else {
            WebhookEvent::OnBatchFailed
        };
        self.notify_completion(HookTarget::Batch(id), event, payload);
    }

    /// Write-behind archive of a terminal task
    fn archive(&self, task: &Task) {
        let Some(db) = self.db.clone() else {
            return;
        };
        let entry = match NewTaskHistory::from_task(task) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to serialize task for history");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(e) = db.insert_task_history(&entry).await {
                tracing::warn!(task_id = entry.task_id, error = %e, "Failed to archive task");
            }
        });
    }
}
