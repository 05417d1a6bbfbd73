//! Task records and the task state machine
//!
//! A [`Task`] is created at `Pending` (or `Scheduled` when it has an eta) and
//! moves only along these edges:
//!
//! ```text
//! Pending | Scheduled | Retrying ──► Running ──► Succeeded | Failed | Retrying
//!          any non-terminal state ──► Cancelled
//! ```
//!
//! `result` and `error` are only ever set on terminal records, and never both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::{Error, Result, TaskError};
use crate::types::{BatchId, Priority, TaskId, TaskKind, TaskStatus, WorkflowId};

/// Positional and keyword arguments passed to a handler
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskInput {
    /// Empty input
    pub fn new() -> Self {
        Self::default()
    }

    /// Input with the given positional arguments
    pub fn from_args(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Insert an upstream result in front of the positional arguments
    pub(crate) fn prepend(&mut self, value: Value) {
        self.args.insert(0, value);
    }
}

/// Everything needed to create one task
///
/// Also used as the leaf of a [`crate::composer::Composition`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Registered kind
    pub kind: TaskKind,
    /// Handler input
    #[serde(default)]
    pub input: TaskInput,
    /// Queue override; None routes by kind
    #[serde(default)]
    pub queue: Option<String>,
    /// Priority within the queue
    #[serde(default)]
    pub priority: Priority,
    /// Retry budget override; None uses the configured policy
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-attempt timeout override
    #[serde(default, with = "crate::config::optional_duration_millis")]
    pub timeout: Option<Duration>,
    /// Earliest execution time (ignored for workflow members)
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
}

impl TaskRequest {
    /// Request with default options
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            input: TaskInput::default(),
            queue: None,
            priority: Priority::default(),
            max_attempts: None,
            timeout: None,
            eta: None,
        }
    }

    /// Replace the whole input
    pub fn input(mut self, input: TaskInput) -> Self {
        self.input = input;
        self
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.input.args.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.input.kwargs.insert(key.into(), value.into());
        self
    }

    /// Send to a specific queue instead of the kind's route
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the retry budget
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay execution until `eta`
    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Delay execution by `countdown` from now
    pub fn countdown(mut self, countdown: Duration) -> Self {
        let delta = chrono::Duration::from_std(countdown).unwrap_or(chrono::Duration::zero());
        self.eta = Some(Utc::now() + delta);
        self
    }
}

/// Composite record a task belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentRef {
    /// Member of a workflow, at a node of its composition tree
    Workflow {
        /// Workflow ID
        id: WorkflowId,
        /// Node index in the workflow's composition tree
        node: usize,
    },
    /// Item of a batch
    Batch {
        /// Batch ID
        id: BatchId,
        /// Item index
        index: usize,
    },
}

/// One unit of work and its execution state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Unique ID
    pub id: TaskId,
    /// Registered kind
    pub kind: TaskKind,
    /// Queue the task is served from
    pub queue: String,
    /// Priority within the queue
    pub priority: Priority,
    /// Handler input
    pub input: TaskInput,
    /// Current status
    pub status: TaskStatus,
    /// Retries consumed so far
    pub attempt: u32,
    /// Retries allowed
    pub max_attempts: u32,
    /// Per-attempt timeout override
    #[serde(default, with = "crate::config::optional_duration_millis")]
    pub timeout: Option<Duration>,
    /// Not visible to workers before this time
    pub not_before: Option<DateTime<Utc>>,
    /// Handler result (Succeeded only)
    pub result: Option<Value>,
    /// Final failure (Failed only)
    pub error: Option<TaskError>,
    /// Failure that triggered the pending retry
    pub last_error: Option<TaskError>,
    /// When the task was accepted
    pub created_at: DateTime<Utc>,
    /// When the latest attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// A cancel arrived while running; no further retries
    pub cancel_requested: bool,
    /// Replacement task created by a retry of this failed task
    pub superseded_by: Option<TaskId>,
    /// Workflow or batch this task belongs to
    pub parent: Option<ParentRef>,
    #[serde(skip)]
    pub(crate) delivery: Option<u64>,
}

impl Task {
    /// Build a fresh record from a request
    pub(crate) fn from_request(
        id: TaskId,
        request: &TaskRequest,
        queue: String,
        default_max_attempts: u32,
        parent: Option<ParentRef>,
    ) -> Self {
        Self {
            id,
            kind: request.kind,
            queue,
            priority: request.priority,
            input: request.input.clone(),
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts),
            timeout: request.timeout,
            not_before: None,
            result: None,
            error: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            superseded_by: None,
            parent,
            delivery: None,
        }
    }

    /// Fresh copy of a failed task for a manual retry: same kind, input and
    /// options, attempt 0, no parent
    pub(crate) fn resubmission(&self, id: TaskId) -> Self {
        Self {
            id,
            kind: self.kind,
            queue: self.queue.clone(),
            priority: self.priority,
            input: self.input.clone(),
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            not_before: None,
            result: None,
            error: None,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            superseded_by: None,
            parent: None,
            delivery: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if can_transition(self.status, next) {
            self.status = next;
            Ok(())
        } else {
            Err(Error::invalid_state(
                self.id,
                &format!("move to {}", next),
                self.status,
            ))
        }
    }

    /// Hold the task until `not_before`
    pub(crate) fn schedule(&mut self, not_before: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Scheduled)?;
        self.not_before = Some(not_before);
        Ok(())
    }

    /// Lease to a worker
    pub(crate) fn start(&mut self, delivery: u64) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.delivery = Some(delivery);
        self.not_before = None;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn succeed(&mut self, result: Value) -> Result<()> {
        self.transition(TaskStatus::Succeeded)?;
        self.result = Some(result);
        self.error = None;
        self.finish();
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.result = None;
        self.error = Some(error.clone());
        self.last_error = Some(error);
        self.finish();
        Ok(())
    }

    /// Queue another attempt. `consume_attempt` is false for infrastructure
    /// failures so they do not eat into the retry budget.
    pub(crate) fn retry(
        &mut self,
        error: TaskError,
        consume_attempt: bool,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        if consume_attempt && self.attempt >= self.max_attempts {
            return Err(Error::invalid_state(
                self.id,
                "retry",
                "retry budget exhausted",
            ));
        }
        self.transition(TaskStatus::Retrying)?;
        if consume_attempt {
            self.attempt += 1;
        }
        self.last_error = Some(error);
        self.not_before = Some(not_before);
        self.delivery = None;
        Ok(())
    }

    pub(crate) fn cancel(&mut self) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.result = None;
        self.error = None;
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.delivery = None;
        self.not_before = None;
        self.finished_at = Some(Utc::now());
    }

    /// Whether `tag` is the live delivery of this task
    pub(crate) fn holds_delivery(&self, tag: u64) -> bool {
        self.status == TaskStatus::Running && self.delivery == Some(tag)
    }
}

fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match (from, to) {
        (Pending, Scheduled) => true,
        (Pending | Scheduled | Retrying, Running) => true,
        (Running, Succeeded | Failed | Retrying) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(max_attempts: u32) -> Task {
        let request = TaskRequest::new(TaskKind::Transcribe)
            .arg("clip.wav")
            .max_attempts(max_attempts);
        Task::from_request(TaskId(1), &request, "ai_processing".into(), 3, None)
    }

    #[test]
    fn request_overrides_default_retry_budget() {
        assert_eq!(task(7).max_attempts, 7);
        let plain = Task::from_request(
            TaskId(2),
            &TaskRequest::new(TaskKind::Publish),
            "publishing".into(),
            3,
            None,
        );
        assert_eq!(plain.max_attempts, 3);
        assert_eq!(plain.status, TaskStatus::Pending);
    }

    #[test]
    fn happy_path_sets_result_only_when_terminal() {
        let mut t = task(3);
        t.start(1).unwrap();
        assert!(t.result.is_none() && t.error.is_none());
        assert!(t.started_at.is_some());
        t.succeed(json!({"text": "hello"})).unwrap();
        assert_eq!(t.status, TaskStatus::Succeeded);
        assert_eq!(t.result, Some(json!({"text": "hello"})));
        assert!(t.error.is_none());
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn retry_consumes_attempt_and_keeps_error_off_record() {
        let mut t = task(2);
        t.start(1).unwrap();
        t.retry(TaskError::transient("429"), true, Utc::now())
            .unwrap();
        assert_eq!(t.status, TaskStatus::Retrying);
        assert_eq!(t.attempt, 1);
        assert!(t.error.is_none());
        assert_eq!(t.last_error, Some(TaskError::transient("429")));
    }

    #[test]
    fn worker_lost_retry_keeps_attempt() {
        let mut t = task(2);
        t.start(1).unwrap();
        t.retry(TaskError::worker_lost("lease expired"), false, Utc::now())
            .unwrap();
        assert_eq!(t.attempt, 0);
        t.start(2).unwrap();
        assert!(t.holds_delivery(2));
        assert!(!t.holds_delivery(1));
    }

    #[test]
    fn attempt_never_exceeds_budget() {
        let mut t = task(1);
        t.start(1).unwrap();
        t.retry(TaskError::transient("x"), true, Utc::now()).unwrap();
        t.start(2).unwrap();
        assert!(
            t.retry(TaskError::transient("x"), true, Utc::now())
                .is_err()
        );
        assert_eq!(t.attempt, 1);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut t = task(3);
        t.start(1).unwrap();
        t.fail(TaskError::permanent("bad input")).unwrap();
        assert!(t.cancel().is_err());
        assert!(t.start(2).is_err());
        assert_eq!(t.error, Some(TaskError::permanent("bad input")));
    }

    #[test]
    fn waiting_states_can_be_cancelled() {
        let mut t = task(3);
        t.schedule(Utc::now()).unwrap();
        assert_eq!(t.status, TaskStatus::Scheduled);
        t.cancel().unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.not_before.is_none());
    }

    #[test]
    fn pending_cannot_jump_to_succeeded() {
        let mut t = task(3);
        assert!(t.succeed(json!(1)).is_err());
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn resubmission_resets_execution_state() {
        let mut t = task(3);
        t.start(1).unwrap();
        t.retry(TaskError::transient("x"), true, Utc::now()).unwrap();
        t.start(2).unwrap();
        t.fail(TaskError::permanent("nope")).unwrap();

        let copy = t.resubmission(TaskId(9));
        assert_eq!(copy.id, TaskId(9));
        assert_eq!(copy.attempt, 0);
        assert_eq!(copy.status, TaskStatus::Pending);
        assert_eq!(copy.input, t.input);
        assert!(copy.error.is_none());
    }

    #[test]
    fn prepend_puts_upstream_result_first() {
        let mut input = TaskInput::new().arg("b").kwarg("lang", "en");
        input.prepend(json!("a"));
        assert_eq!(input.args, vec![json!("a"), json!("b")]);
        assert_eq!(input.kwargs["lang"], "en");
    }
}
