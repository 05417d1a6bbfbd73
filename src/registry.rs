//! Typed task registry
//!
//! Handlers are registered per [`TaskKind`] when the engine is built and looked
//! up by kind at execution time. A handler is the adapter to an external
//! operation: it receives the task input plus a cancellation token and returns
//! either a JSON result or a classified [`TaskError`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::progress::ProgressReporter;
use crate::task::TaskInput;
use crate::types::{TaskId, TaskKind};

/// Everything a handler gets for one execution
#[derive(Clone, Debug)]
pub struct TaskContext {
    /// Task being executed
    pub task_id: TaskId,
    /// Registered kind
    pub kind: TaskKind,
    /// Positional and keyword arguments
    pub input: TaskInput,
    /// Retries consumed before this execution
    pub attempt: u32,
    /// Cancelled when an operator hard-cancels the task or the attempt times out
    pub cancel: CancellationToken,
    /// Progress sink
    pub progress: ProgressReporter,
}

impl TaskContext {
    /// Positional argument `index`
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.input.args.get(index)
    }

    /// Keyword argument `name`
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.input.kwargs.get(name)
    }

    /// Deserialize positional argument `index`, failing permanently when it
    /// is missing or malformed
    pub fn parse_arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self
            .arg(index)
            .ok_or_else(|| TaskError::permanent(format!("missing argument {}", index)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Whether the task was hard-cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report progress
    pub fn report_progress(&self, current: u64, total: u64, message: Option<&str>) {
        self.progress.report(current, total, message);
    }
}

/// Executes one kind of task
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one attempt
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError>;

    /// Per-attempt timeout for this kind; None uses the configured default
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
    timeout: Option<Duration>,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        (self.f)(ctx).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Mapping from task kind to handler, built once at startup
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the kind
    pub fn register(mut self, kind: TaskKind, handler: impl TaskHandler) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(self, kind: TaskKind, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(kind, FnHandler { f, timeout: None })
    }

    /// Register an async closure with its own per-attempt timeout
    pub fn register_fn_with_timeout<F, Fut>(self, kind: TaskKind, timeout: Duration, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(
            kind,
            FnHandler {
                f,
                timeout: Some(timeout),
            },
        )
    }

    /// Handler for a kind
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Whether a kind has a handler
    pub fn contains(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds
    pub fn kinds(&self) -> Vec<TaskKind> {
        self.handlers.keys().copied().collect()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
