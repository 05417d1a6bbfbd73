//! Database layer for clipflow
//!
//! Optional SQLite archive of tasks that reached a terminal status. The
//! in-memory record store stays the engine's source of truth; this is a
//! write-behind history for inspection after the fact.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`history`] — Task history inserts and queries

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, sqlite::SqlitePool};

use crate::error::{FailureKind, TaskError};
use crate::task::{ParentRef, Task};
use crate::types::{TaskId, TaskKind, TaskStatus};

mod history;
mod migrations;

/// Terminal task to be archived
#[derive(Debug, Clone)]
pub struct NewTaskHistory {
    /// Task ID
    pub task_id: i64,
    /// Task kind name
    pub kind: String,
    /// Queue the task ran on
    pub queue: String,
    /// Priority (1-10)
    pub priority: i32,
    /// Status code (see [`TaskStatus::to_i32`])
    pub status: i32,
    /// Retries consumed
    pub attempt: i32,
    /// Retry budget
    pub max_attempts: i32,
    /// Handler input as JSON
    pub input: String,
    /// Result as JSON
    pub result: Option<String>,
    /// Failure classification
    pub error_kind: Option<String>,
    /// Failure message
    pub error_message: Option<String>,
    /// Owning workflow
    pub workflow_id: Option<i64>,
    /// Owning batch
    pub batch_id: Option<i64>,
    /// Unix timestamp when the task was accepted
    pub created_at: i64,
    /// Unix timestamp when the last attempt started
    pub started_at: Option<i64>,
    /// Unix timestamp when the task finished
    pub finished_at: i64,
}

impl NewTaskHistory {
    /// Flatten a task record for archiving
    pub fn from_task(task: &Task) -> crate::Result<Self> {
        let (workflow_id, batch_id) = match task.parent {
            Some(ParentRef::Workflow { id, .. }) => (Some(id.get()), None),
            Some(ParentRef::Batch { id, .. }) => (None, Some(id.get())),
            None => (None, None),
        };
        let error = task.error.as_ref();
        Ok(Self {
            task_id: task.id.get(),
            kind: task.kind.as_str().to_string(),
            queue: task.queue.clone(),
            priority: i32::from(task.priority.get()),
            status: task.status.to_i32(),
            attempt: task.attempt as i32,
            max_attempts: task.max_attempts as i32,
            input: serde_json::to_string(&task.input)?,
            result: task.result.as_ref().map(serde_json::to_string).transpose()?,
            error_kind: error.map(|e| e.kind.to_string()),
            error_message: error.map(|e| e.message.clone()),
            workflow_id,
            batch_id,
            created_at: task.created_at.timestamp(),
            started_at: task.started_at.map(|t| t.timestamp()),
            finished_at: task.finished_at.unwrap_or_else(Utc::now).timestamp(),
        })
    }
}

/// Task history record from database (raw from SQLite)
#[derive(Debug, Clone, FromRow)]
pub struct TaskHistoryRow {
    /// Unique database ID
    pub id: i64,
    /// Task ID
    pub task_id: i64,
    /// Task kind name
    pub kind: String,
    /// Queue the task ran on
    pub queue: String,
    /// Priority (1-10)
    pub priority: i32,
    /// Status code
    pub status: i32,
    /// Retries consumed
    pub attempt: i32,
    /// Retry budget
    pub max_attempts: i32,
    /// Handler input as JSON
    pub input: String,
    /// Result as JSON
    pub result: Option<String>,
    /// Failure classification
    pub error_kind: Option<String>,
    /// Failure message
    pub error_message: Option<String>,
    /// Owning workflow
    pub workflow_id: Option<i64>,
    /// Owning batch
    pub batch_id: Option<i64>,
    /// Unix timestamp when the task was accepted
    pub created_at: i64,
    /// Unix timestamp when the last attempt started
    pub started_at: Option<i64>,
    /// Unix timestamp when the task finished
    pub finished_at: i64,
}

/// Archived task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    /// Unique database ID
    pub id: i64,
    /// Task ID
    pub task_id: TaskId,
    /// Task kind, None if the name is no longer known
    pub kind: Option<TaskKind>,
    /// Queue the task ran on
    pub queue: String,
    /// Priority (1-10)
    pub priority: u8,
    /// Final status
    pub status: TaskStatus,
    /// Retries consumed
    pub attempt: u32,
    /// Retry budget
    pub max_attempts: u32,
    /// Handler input
    pub input: Value,
    /// Result
    pub result: Option<Value>,
    /// Final failure
    pub error: Option<TaskError>,
    /// Owning workflow ID
    pub workflow_id: Option<i64>,
    /// Owning batch ID
    pub batch_id: Option<i64>,
    /// When the task was accepted
    pub created_at: DateTime<Utc>,
    /// When the last attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task finished
    pub finished_at: DateTime<Utc>,
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn failure_kind(name: &str) -> FailureKind {
    match name {
        "permanent" => FailureKind::Permanent,
        "worker_lost" => FailureKind::WorkerLost,
        _ => FailureKind::Transient,
    }
}

impl From<TaskHistoryRow> for TaskHistoryEntry {
    fn from(row: TaskHistoryRow) -> Self {
        let error = match (row.error_kind, row.error_message) {
            (Some(kind), message) => Some(TaskError::new(
                failure_kind(&kind),
                message.unwrap_or_default(),
            )),
            (None, Some(message)) => Some(TaskError::transient(message)),
            (None, None) => None,
        };

        TaskHistoryEntry {
            id: row.id,
            task_id: TaskId(row.task_id),
            kind: row.kind.parse().ok(),
            queue: row.queue,
            priority: row.priority.clamp(0, u8::MAX as i32) as u8,
            status: TaskStatus::from_i32(row.status),
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            input: serde_json::from_str(&row.input).unwrap_or(Value::Null),
            result: row.result.and_then(|r| serde_json::from_str(&r).ok()),
            error,
            workflow_id: row.workflow_id,
            batch_id: row.batch_id,
            created_at: timestamp(row.created_at),
            started_at: row.started_at.map(timestamp),
            finished_at: timestamp(row.finished_at),
        }
    }
}

/// Database handle for clipflow
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
