//! Error types for clipflow
//!
//! Two layers of errors live here:
//! - [`Error`] is returned by engine operations (submission, control plane, persistence)
//! - [`TaskError`] is returned by task handlers and recorded on the task; its
//!   [`FailureKind`] drives the retry policy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for clipflow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for clipflow
///
/// Each variant carries enough context to tell the caller which record or
/// setting was involved.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retry.max_delay")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Operation is not valid for the record's current status
    #[error("cannot {operation} {id} in state {current_state}")]
    InvalidState {
        /// The record the operation targeted (e.g., "task 12", "batch 3")
        id: String,
        /// The operation that was attempted (e.g., "retry", "start")
        operation: String,
        /// The status that prevents the operation
        current_state: String,
    },

    /// Task, workflow or batch not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Queue name is not configured
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// No handler registered for a task kind
    #[error("no handler registered for task kind {0}")]
    NoHandler(String),

    /// Submission was rejected (empty composition, bad priority, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn invalid_state(
        id: impl std::fmt::Display,
        operation: &str,
        current_state: impl std::fmt::Display,
    ) -> Self {
        Error::InvalidState {
            id: id.to_string(),
            operation: operation.to_string(),
            current_state: current_state.to_string(),
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Classification of a failed task execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate limits, timeouts, network errors; retried with backoff
    Transient,
    /// Invalid input, unsupported target, authorization failure; never retried
    Permanent,
    /// The executing worker vanished without settling; redelivered without
    /// consuming an attempt
    WorkerLost,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::WorkerLost => "worker_lost",
        };
        f.write_str(s)
    }
}

/// Failure returned by a task handler
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct TaskError {
    /// How the retry policy should treat this failure
    pub kind: FailureKind,
    /// Human-readable detail
    pub message: String,
}

impl TaskError {
    /// Create an error with an explicit classification
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Retryable failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Non-retryable failure
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// Infrastructure failure (panic, lost lease)
    pub fn worker_lost(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerLost, message)
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        let permanent = e
            .status()
            .is_some_and(|s| s.is_client_error() && s != reqwest::StatusCode::TOO_MANY_REQUESTS);
        if permanent {
            TaskError::permanent(e.to_string())
        } else {
            TaskError::transient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::permanent(format!("invalid task input: {}", e))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let err = Error::invalid_state("task 7", "retry", "running");
        assert_eq!(err.to_string(), "cannot retry task 7 in state running");
    }

    #[test]
    fn task_error_display_includes_kind() {
        let err = TaskError::transient("rate limited");
        assert_eq!(err.to_string(), "transient failure: rate limited");
        assert_eq!(
            TaskError::worker_lost("panic").to_string(),
            "worker_lost failure: panic"
        );
    }

    #[test]
    fn task_error_serializes_kind_in_snake_case() {
        let json = serde_json::to_value(TaskError::permanent("bad url")).unwrap();
        assert_eq!(json["kind"], "permanent");
        assert_eq!(json["message"], "bad url");
    }

    #[test]
    fn malformed_input_is_permanent() {
        let parse_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: TaskError = parse_err.into();
        assert_eq!(err.kind, FailureKind::Permanent);
    }
}
