//! Task, workflow and batch submission.

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};

use crate::batch::{BatchJob, BatchRequest};
use crate::composer::{Composition, WorkflowState};
use crate::error::{Error, Result};
use crate::task::{ParentRef, Task, TaskRequest};
use crate::types::{BatchId, Event, TaskId, WorkflowId};

use super::webhooks::HookTarget;
use super::{CompletionHook, Engine, lock};

impl Engine {
    /// Submit a single task
    ///
    /// The task is routed to `request.queue`, or to the queue configured for
    /// its kind. An `eta` in the future keeps it Scheduled until then.
    ///
    /// # Errors
    ///
    /// - [`Error::NoHandler`] if no handler is registered for the kind
    /// - [`Error::UnknownQueue`] if the target queue is not configured
    /// - [`Error::ShuttingDown`] once shutdown has begun
    pub fn submit_task(&self, request: TaskRequest) -> Result<TaskId> {
        self.ensure_accepting()?;
        self.validate_request(&request)?;
        let id = self.records.ids.next_task();
        self.enqueue_request(id, &request, request.eta, None)
    }

    /// Submit a chain, group, chord or any nesting of them
    ///
    /// Every member is validated before anything is enqueued, so a rejected
    /// workflow leaves no tasks behind.
    pub fn submit_workflow(&self, composition: Composition) -> Result<WorkflowId> {
        self.submit_workflow_inner(composition, None)
    }

    /// Submit a workflow and call `hook` once when it reaches a terminal status
    pub fn submit_workflow_with_hook(
        &self,
        composition: Composition,
        hook: CompletionHook,
    ) -> Result<WorkflowId> {
        self.submit_workflow_inner(composition, Some(hook))
    }

    fn submit_workflow_inner(
        &self,
        composition: Composition,
        hook: Option<CompletionHook>,
    ) -> Result<WorkflowId> {
        self.ensure_accepting()?;
        composition.validate()?;
        for request in composition.requests() {
            self.validate_request(request)?;
        }

        let id = self.records.ids.next_workflow();
        if let Some(hook) = hook {
            lock(&self.runtime.hooks).insert(HookTarget::Workflow(id), hook);
        }

        let mut state = WorkflowState::new(id, composition);
        let actions = state.start(&self.records.ids);
        self.records.workflows.insert(id, state);
        tracing::info!(workflow_id = %id, "Workflow submitted");

        self.apply_workflow_actions(id, actions);
        Ok(id)
    }

    /// Submit a batch: one task per item, at most `concurrency_limit` in flight
    ///
    /// The limit defaults to `batch.default_concurrency` and must lie in
    /// `1..=batch.max_concurrency`.
    pub fn submit_batch(&self, request: BatchRequest) -> Result<BatchId> {
        self.submit_batch_inner(request, None)
    }

    /// Submit a batch and call `hook` once when it reaches a terminal status
    pub fn submit_batch_with_hook(
        &self,
        request: BatchRequest,
        hook: CompletionHook,
    ) -> Result<BatchId> {
        self.submit_batch_inner(request, Some(hook))
    }

    fn submit_batch_inner(
        &self,
        request: BatchRequest,
        hook: Option<CompletionHook>,
    ) -> Result<BatchId> {
        self.ensure_accepting()?;

        let limit = request
            .concurrency_limit
            .unwrap_or(self.config.batch.default_concurrency);
        if limit == 0 || limit > self.config.batch.max_concurrency {
            return Err(Error::InvalidRequest(format!(
                "concurrency limit must be between 1 and {}, got {}",
                self.config.batch.max_concurrency, limit
            )));
        }
        if let Some(sample) = request.item_request(BatchId(0), 0) {
            self.validate_request(&sample)?;
        } else if !self.registry.contains(request.kind) {
            return Err(Error::NoHandler(request.kind.to_string()));
        }

        let id = self.records.ids.next_batch();
        self.records
            .batches
            .insert(id, BatchJob::new(id, &request, limit));
        if let Some(hook) = hook {
            lock(&self.runtime.hooks).insert(HookTarget::Batch(id), hook);
        }
        let token = self.runtime.shutdown.child_token();
        lock(&self.runtime.batch_tokens).insert(id, token.clone());

        tracing::info!(
            batch_id = %id,
            kind = %request.kind,
            items = request.items.len(),
            concurrency = limit,
            "Batch submitted"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_batch(id, request, limit, token).await;
        });

        Ok(id)
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        if self.runtime.accepting_new.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Check a request against the registry and queue set; returns its queue
    pub(crate) fn validate_request(&self, request: &TaskRequest) -> Result<String> {
        if !self.registry.contains(request.kind) {
            return Err(Error::NoHandler(request.kind.to_string()));
        }
        if let Some(timeout) = request.timeout {
            if timeout.is_zero() {
                return Err(Error::InvalidRequest("timeout must be non-zero".into()));
            }
            // a handler still running when its lease expires would be redelivered forever
            let lease = self.config.execution.lease_timeout;
            if timeout >= lease {
                return Err(Error::InvalidRequest(format!(
                    "timeout of {}s must be shorter than the {}s lease timeout",
                    timeout.as_secs(),
                    lease.as_secs()
                )));
            }
        }
        let queue = request
            .queue
            .clone()
            .unwrap_or_else(|| self.config.route(request.kind).to_string());
        if !self.queue.has_queue(&queue) {
            return Err(Error::UnknownQueue(queue));
        }
        Ok(queue)
    }

    /// Create the task record for `request` under `id` and enqueue it
    pub(crate) fn enqueue_request(
        &self,
        id: TaskId,
        request: &TaskRequest,
        eta: Option<DateTime<Utc>>,
        parent: Option<ParentRef>,
    ) -> Result<TaskId> {
        let queue = self.validate_request(request)?;
        let task = Task::from_request(
            id,
            request,
            queue.clone(),
            self.retry_policy.max_attempts(),
            parent,
        );

        self.emit_event(Event::TaskQueued {
            id,
            kind: request.kind,
            queue: queue.clone(),
        });
        self.queue.enqueue(task, eta)?;

        tracing::debug!(task_id = %id, kind = %request.kind, queue = %queue, "Task submitted");
        Ok(id)
    }
}
