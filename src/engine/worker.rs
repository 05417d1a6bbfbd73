//! Execution of one leased task.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TaskError};
use crate::pool::{DeliveryExecutor, ExecutionOutcome};
use crate::progress::ProgressReporter;
use crate::queue::Delivery;
use crate::registry::TaskContext;
use crate::retry::RetryDecision;
use crate::task::Task;
use crate::types::{Event, TaskId};

use super::{Engine, lock};

/// What the record store accepted for one execution
enum Settled {
    Succeeded,
    Failed(TaskError),
    Cancelled,
    Retrying {
        attempt: u32,
        delay: Duration,
        error: TaskError,
    },
}

#[async_trait]
impl DeliveryExecutor for Engine {
    async fn execute(&self, delivery: Delivery) -> ExecutionOutcome {
        let Some(task) = self
            .records
            .tasks
            .get(delivery.task_id)
            .filter(|t| t.holds_delivery(delivery.tag))
        else {
            self.queue.nack(
                delivery.task_id,
                delivery.tag,
                false,
                TaskError::permanent(format!(
                    "delivery {} does not match the task record",
                    delivery.tag
                )),
            );
            return ExecutionOutcome::Discarded;
        };

        let outcome = self.run_handler(&task, delivery.tag).await;

        if !self.queue.ack(task.id, delivery.tag) {
            tracing::warn!(
                task_id = %task.id,
                "Lease lost before the outcome was recorded, discarding it"
            );
            return ExecutionOutcome::Discarded;
        }

        match self.settle(task.id, delivery.tag, outcome) {
            Ok(settled) => self.after_settle(&task, settled),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Execution outcome not recorded");
                ExecutionOutcome::Discarded
            }
        }
    }
}

impl Engine {
    /// Run the handler under the resolved timeout
    ///
    /// Timeout precedence: the task's own, then the handler's, then
    /// `execution.task_timeout`. A timed-out or panicking handler counts as a
    /// transient failure.
    async fn run_handler(&self, task: &Task, tag: u64) -> std::result::Result<Value, TaskError> {
        let Some(handler) = self.registry.get(task.kind) else {
            return Err(TaskError::permanent(format!(
                "no handler registered for {}",
                task.kind
            )));
        };
        let timeout = task
            .timeout
            .or_else(|| handler.timeout())
            .unwrap_or(self.config.execution.task_timeout);

        let cancel = CancellationToken::new();
        lock(&self.runtime.active).insert(task.id, (tag, cancel.clone()));

        self.emit_event(Event::TaskStarted {
            id: task.id,
            attempt: task.attempt,
        });
        tracing::info!(
            task_id = %task.id,
            kind = %task.kind,
            queue = %task.queue,
            attempt = task.attempt,
            "Task started"
        );

        let ctx = TaskContext {
            task_id: task.id,
            kind: task.kind,
            input: task.input.clone(),
            attempt: task.attempt,
            cancel: cancel.clone(),
            progress: ProgressReporter::new(task.id, self.progress.clone(), self.event_tx.clone()),
        };
        let mut handle = tokio::spawn(async move { handler.execute(ctx).await });

        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(task_id = %task.id, "Task handler panicked");
                Err(TaskError::transient("handler panicked"))
            }
            Ok(Err(e)) => Err(TaskError::transient(format!("handler aborted: {}", e))),
            Err(_) => {
                cancel.cancel();
                handle.abort();
                Err(TaskError::transient(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        };

        {
            // a redelivered copy may have registered its own token meanwhile
            let mut active = lock(&self.runtime.active);
            if active.get(&task.id).is_some_and(|(t, _)| *t == tag) {
                active.remove(&task.id);
            }
        }
        outcome
    }

    /// Apply an execution outcome to the task record
    ///
    /// Runs as a single store update so a concurrent cancel or lease reclaim
    /// sees either the old record or the settled one.
    fn settle(
        &self,
        id: TaskId,
        tag: u64,
        outcome: std::result::Result<Value, TaskError>,
    ) -> Result<Settled> {
        let policy = &self.retry_policy;
        self.records
            .tasks
            .update(id, |t| {
                if !t.holds_delivery(tag) {
                    return Err(crate::Error::invalid_state(id, "settle", t.status));
                }
                match outcome {
                    Ok(value) => t.succeed(value).map(|_| Settled::Succeeded),
                    Err(_) if t.cancel_requested => t.cancel().map(|_| Settled::Cancelled),
                    Err(error) => match policy.decide(error.kind, t.attempt, t.max_attempts) {
                        RetryDecision::Retry {
                            delay,
                            consume_attempt,
                        } => {
                            let not_before = Utc::now()
                                + chrono::Duration::from_std(delay).unwrap_or_default();
                            t.retry(error.clone(), consume_attempt, not_before)?;
                            Ok(Settled::Retrying {
                                attempt: t.attempt,
                                delay,
                                error,
                            })
                        }
                        RetryDecision::GiveUp => {
                            t.fail(error.clone())?;
                            Ok(Settled::Failed(error))
                        }
                    },
                }
            })
            .ok_or_else(|| crate::Error::NotFound(id.to_string()))?
    }

    fn after_settle(&self, task: &Task, settled: Settled) -> ExecutionOutcome {
        match settled {
            Settled::Retrying {
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    task_id = %task.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task failed, retrying"
                );
                self.progress.clear(task.id);
                self.emit_event(Event::TaskRetrying {
                    id: task.id,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error,
                });
                if let Err(e) = self.queue.requeue(task.id, delay) {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to requeue task");
                }
                ExecutionOutcome::Retrying
            }
            Settled::Succeeded => {
                tracing::info!(task_id = %task.id, kind = %task.kind, "Task succeeded");
                self.emit_event(Event::TaskSucceeded { id: task.id });
                self.on_task_terminal(task.id);
                ExecutionOutcome::Succeeded
            }
            Settled::Failed(error) => {
                tracing::error!(task_id = %task.id, kind = %task.kind, error = %error, "Task failed");
                self.emit_event(Event::TaskFailed { id: task.id, error });
                self.on_task_terminal(task.id);
                ExecutionOutcome::Failed
            }
            Settled::Cancelled => {
                tracing::info!(task_id = %task.id, "Task cancelled while running");
                self.emit_event(Event::TaskCancelled { id: task.id });
                self.on_task_terminal(task.id);
                ExecutionOutcome::Cancelled
            }
        }
    }
}
