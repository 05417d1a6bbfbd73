//! Batch job records
//!
//! A batch is a bounded-concurrency fan-out of one task kind over many input
//! values. This module holds the record and its bookkeeping; scheduling lives
//! in the engine's batch coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::TaskError;
use crate::progress::percent;
use crate::task::TaskRequest;
use crate::types::{BatchId, BatchStatus, Priority, TaskId, TaskKind, TaskStatus};

/// Submission parameters for a batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Kind every item runs as
    pub kind: TaskKind,
    /// One input value per item, passed as the first positional argument
    pub items: Vec<Value>,
    /// Maximum items in flight; None uses the configured default
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    /// Opaque owner reference
    #[serde(default)]
    pub user_ref: Option<String>,
    /// Queue override for item tasks
    #[serde(default)]
    pub queue: Option<String>,
    /// Priority of item tasks
    #[serde(default)]
    pub priority: Priority,
    /// Retry budget override for item tasks
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Per-attempt timeout override for item tasks
    #[serde(default, with = "crate::config::optional_duration_millis")]
    pub timeout: Option<Duration>,
    /// Keyword arguments shared by every item
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl BatchRequest {
    /// Batch of `kind` over `items`
    pub fn new(kind: TaskKind, items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            kind,
            items: items.into_iter().collect(),
            concurrency_limit: None,
            user_ref: None,
            queue: None,
            priority: Priority::default(),
            max_attempts: None,
            timeout: None,
            kwargs: Map::new(),
        }
    }

    /// Limit items in flight
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Tag the batch with an owner
    pub fn user(mut self, user_ref: impl Into<String>) -> Self {
        self.user_ref = Some(user_ref.into());
        self
    }

    /// Send item tasks to a specific queue
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Priority of item tasks
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Retry budget of item tasks
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Per-attempt timeout of item tasks
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keyword argument passed to every item
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Task request for item `index`
    pub(crate) fn item_request(&self, batch: BatchId, index: usize) -> Option<TaskRequest> {
        let item = self.items.get(index)?.clone();
        let mut request = TaskRequest::new(self.kind)
            .arg(item)
            .priority(self.priority)
            .kwarg("batch_id", batch.get())
            .kwarg("item_index", index);
        for (key, value) in &self.kwargs {
            request = request.kwarg(key.clone(), value.clone());
        }
        request.queue = self.queue.clone();
        request.max_attempts = self.max_attempts;
        request.timeout = self.timeout;
        Some(request)
    }
}

/// Per-item state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Not scheduled yet
    Pending,
    /// Task submitted and not terminal
    Running,
    /// Task succeeded
    Succeeded,
    /// Task failed terminally
    Failed,
    /// Task cancelled, or never scheduled because the batch was cancelled
    Cancelled,
}

impl ItemStatus {
    /// Whether the item has its final outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }
}

/// Outcome of one item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Position in the batch
    pub index: usize,
    /// Task created for the item
    pub task_id: Option<TaskId>,
    /// Item state
    pub status: ItemStatus,
    /// Task result on success
    pub result: Option<Value>,
    /// Failure detail
    pub error: Option<TaskError>,
}

/// A batch job and its per-item results
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Unique ID
    pub id: BatchId,
    /// Owner reference
    pub user_ref: Option<String>,
    /// Kind every item runs as
    pub kind: TaskKind,
    /// Input values
    pub items: Vec<Value>,
    /// Maximum items in flight
    pub concurrency_limit: usize,
    /// Aggregate status
    pub status: BatchStatus,
    /// Outcomes aligned with `items`
    pub results: Vec<ItemOutcome>,
    /// Items that succeeded
    pub succeeded_count: usize,
    /// Items that failed
    pub failed_count: usize,
    /// An explicit cancel stopped scheduling
    pub cancel_requested: bool,
    /// Coordinator fault (Failed only)
    pub error: Option<String>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// When the coordinator started
    pub started_at: Option<DateTime<Utc>>,
    /// When the batch reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub(crate) fn new(id: BatchId, request: &BatchRequest, concurrency_limit: usize) -> Self {
        let results = (0..request.items.len())
            .map(|index| ItemOutcome {
                index,
                task_id: None,
                status: ItemStatus::Pending,
                result: None,
                error: None,
            })
            .collect();
        Self {
            id,
            user_ref: request.user_ref.clone(),
            kind: request.kind,
            items: request.items.clone(),
            concurrency_limit,
            status: BatchStatus::Pending,
            results,
            succeeded_count: 0,
            failed_count: 0,
            cancel_requested: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn start(&mut self) -> bool {
        if self.status != BatchStatus::Pending {
            return false;
        }
        self.status = BatchStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Claim item `index` for scheduling; false once the batch is cancelled
    pub(crate) fn begin_item(&mut self, index: usize, task_id: TaskId) -> bool {
        if self.cancel_requested || self.status.is_terminal() {
            return false;
        }
        match self.results.get_mut(index) {
            Some(item) if item.status == ItemStatus::Pending => {
                item.status = ItemStatus::Running;
                item.task_id = Some(task_id);
                true
            }
            _ => false,
        }
    }

    /// Record an item task's terminal outcome; duplicates are ignored
    pub(crate) fn record(
        &mut self,
        index: usize,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    ) -> bool {
        let Some(item) = self.results.get_mut(index) else {
            return false;
        };
        if item.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        match status {
            TaskStatus::Succeeded => {
                item.status = ItemStatus::Succeeded;
                item.result = result;
                self.succeeded_count += 1;
            }
            TaskStatus::Failed => {
                item.status = ItemStatus::Failed;
                item.error = error;
                self.failed_count += 1;
            }
            _ => item.status = ItemStatus::Cancelled,
        }
        true
    }

    pub(crate) fn request_cancel(&mut self) -> bool {
        if self.status.is_terminal() || self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }

    /// Close the batch once nothing is in flight. Items never scheduled are
    /// marked Cancelled. Returns the final status, or None if already terminal.
    pub(crate) fn finalize(&mut self) -> Option<BatchStatus> {
        if self.status.is_terminal() {
            return None;
        }
        for item in &mut self.results {
            if item.status == ItemStatus::Pending {
                item.status = ItemStatus::Cancelled;
            }
        }
        self.status = if self.cancel_requested {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        };
        self.finished_at = Some(Utc::now());
        Some(self.status)
    }

    /// Coordinator fault
    pub(crate) fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = BatchStatus::Failed;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
        true
    }

    /// Items with a final outcome
    pub fn terminal_count(&self) -> usize {
        self.results
            .iter()
            .filter(|item| item.status.is_terminal())
            .count()
    }

    /// Items currently in flight
    pub fn running_count(&self) -> usize {
        self.results
            .iter()
            .filter(|item| item.status == ItemStatus::Running)
            .count()
    }

    /// `100 * terminal / total`
    pub fn progress_percent(&self) -> f64 {
        percent(self.terminal_count(), self.items.len())
    }

    /// Succeeded items as a percentage of all items
    pub fn success_rate(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        percent(self.succeeded_count, self.items.len())
    }
}
