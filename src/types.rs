//! Core types and events for clipflow

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{Error, TaskError};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} {}", $label, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

record_id!(
    /// Unique identifier for a task
    TaskId,
    "task"
);
record_id!(
    /// Unique identifier for a workflow
    WorkflowId,
    "workflow"
);
record_id!(
    /// Unique identifier for a batch job
    BatchId,
    "batch"
);

/// Monotonic id source shared by one engine instance
#[derive(Debug)]
pub(crate) struct IdAllocator {
    tasks: AtomicI64,
    workflows: AtomicI64,
    batches: AtomicI64,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            tasks: AtomicI64::new(1),
            workflows: AtomicI64::new(1),
            batches: AtomicI64::new(1),
        }
    }

    pub(crate) fn next_task(&self) -> TaskId {
        TaskId(self.tasks.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_workflow(&self) -> WorkflowId {
        WorkflowId(self.workflows.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_batch(&self) -> BatchId {
        BatchId(self.batches.fetch_add(1, Ordering::Relaxed))
    }
}

/// Task priority, 1 (lowest) to 10 (most urgent)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority
    pub const MIN: Priority = Priority(1);
    /// Highest priority
    pub const MAX: Priority = Priority(10);
    /// Priority used when a submission does not set one
    pub const NORMAL: Priority = Priority(5);

    /// Create a priority, rejecting values outside 1..=10
    pub fn new(value: u8) -> crate::Result<Self> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidRequest(format!(
                "priority must be between 1 and 10, got {}",
                value
            )))
        }
    }

    /// Get the numeric value
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

/// Registered task kinds of the content pipeline
///
/// Dispatch goes through a typed registry keyed by this enum; every kind has a
/// default queue that configuration routes may override.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Download a source video
    IngestVideo,
    /// Extract the audio track from a video
    ExtractAudio,
    /// Speech-to-text transcription
    Transcribe,
    /// Sentiment analysis of a transcript
    AnalyzeSentiment,
    /// Rewrite a transcript into a new script
    RewriteScript,
    /// Text-to-speech synthesis
    SynthesizeVoice,
    /// Render an avatar video from a voice track
    GenerateAvatar,
    /// Publish a finished video to a platform
    Publish,
    /// Anything else (bookkeeping, notifications)
    Generic,
}

impl TaskKind {
    /// All kinds, in pipeline order
    pub const ALL: [TaskKind; 9] = [
        TaskKind::IngestVideo,
        TaskKind::ExtractAudio,
        TaskKind::Transcribe,
        TaskKind::AnalyzeSentiment,
        TaskKind::RewriteScript,
        TaskKind::SynthesizeVoice,
        TaskKind::GenerateAvatar,
        TaskKind::Publish,
        TaskKind::Generic,
    ];

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IngestVideo => "ingest_video",
            TaskKind::ExtractAudio => "extract_audio",
            TaskKind::Transcribe => "transcribe",
            TaskKind::AnalyzeSentiment => "analyze_sentiment",
            TaskKind::RewriteScript => "rewrite_script",
            TaskKind::SynthesizeVoice => "synthesize_voice",
            TaskKind::GenerateAvatar => "generate_avatar",
            TaskKind::Publish => "publish",
            TaskKind::Generic => "generic",
        }
    }

    /// Queue this kind is routed to unless configuration overrides it
    pub fn default_queue(&self) -> &'static str {
        match self {
            TaskKind::IngestVideo | TaskKind::ExtractAudio | TaskKind::GenerateAvatar => {
                "video_processing"
            }
            TaskKind::Transcribe
            | TaskKind::AnalyzeSentiment
            | TaskKind::RewriteScript
            | TaskKind::SynthesizeVoice => "ai_processing",
            TaskKind::Publish => "publishing",
            TaskKind::Generic => "default",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown task kind '{}'", s)))
    }
}

/// Task execution status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in its queue
    Pending,
    /// Waiting for its eta before becoming visible
    Scheduled,
    /// Leased by a worker
    Running,
    /// Finished with a result
    Succeeded,
    /// Finished with an error and no retries left
    Failed,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Stopped by an operator
    Cancelled,
}

impl TaskStatus {
    /// Succeeded, Failed and Cancelled are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the task sits in a queue waiting for a worker
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::Retrying
        )
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Convert integer status code to TaskStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Scheduled,
            2 => TaskStatus::Running,
            3 => TaskStatus::Succeeded,
            4 => TaskStatus::Failed,
            5 => TaskStatus::Retrying,
            6 => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }

    /// Convert TaskStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Scheduled => 1,
            TaskStatus::Running => 2,
            TaskStatus::Succeeded => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Retrying => 5,
            TaskStatus::Cancelled => 6,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a workflow or one of its composition nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Nothing started yet
    Pending,
    /// At least one member still running or waiting
    Running,
    /// Every member succeeded
    Succeeded,
    /// At least one member failed
    Failed,
    /// Halted by a cancelled member
    Cancelled,
}

impl WorkflowStatus {
    /// Succeeded, Failed and Cancelled are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Severity used to surface the worst-case status of a set of members
    pub(crate) fn severity(&self) -> u8 {
        match self {
            WorkflowStatus::Succeeded => 0,
            WorkflowStatus::Pending => 1,
            WorkflowStatus::Running => 2,
            WorkflowStatus::Cancelled => 3,
            WorkflowStatus::Failed => 4,
        }
    }

    /// Worst of two statuses
    pub(crate) fn worst(self, other: WorkflowStatus) -> WorkflowStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl From<TaskStatus> for WorkflowStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending | TaskStatus::Scheduled => WorkflowStatus::Pending,
            TaskStatus::Running | TaskStatus::Retrying => WorkflowStatus::Running,
            TaskStatus::Succeeded => WorkflowStatus::Succeeded,
            TaskStatus::Failed => WorkflowStatus::Failed,
            TaskStatus::Cancelled => WorkflowStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Batch job status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepted, coordinator not yet running
    Pending,
    /// Items are being scheduled or are in flight
    Running,
    /// Every item has a terminal result (some may have failed)
    Completed,
    /// The coordinator itself could not schedule items
    Failed,
    /// Scheduling stopped by an explicit cancel
    Cancelled,
}

impl BatchStatus {
    /// Completed, Failed and Cancelled are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the engine
///
/// Subscribe with [`crate::Engine::subscribe`] or [`crate::Engine::events`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task accepted into a queue
    TaskQueued {
        /// Task ID
        id: TaskId,
        /// Registered kind
        kind: TaskKind,
        /// Target queue
        queue: String,
    },

    /// A worker started executing the task
    TaskStarted {
        /// Task ID
        id: TaskId,
        /// Retry count of this execution (0 for the first run)
        attempt: u32,
    },

    /// Progress reported by a running handler
    TaskProgress {
        /// Task ID
        id: TaskId,
        /// Progress percentage (0.0 to 100.0)
        percent: f64,
        /// Optional stage description
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Execution failed and another attempt is scheduled
    TaskRetrying {
        /// Task ID
        id: TaskId,
        /// Retry count of the upcoming attempt
        attempt: u32,
        /// Backoff before the next attempt, in milliseconds
        delay_ms: u64,
        /// The failure that triggered the retry
        error: TaskError,
    },

    /// Task finished with a result
    TaskSucceeded {
        /// Task ID
        id: TaskId,
    },

    /// Task failed terminally
    TaskFailed {
        /// Task ID
        id: TaskId,
        /// Last recorded failure
        error: TaskError,
    },

    /// Task cancelled
    TaskCancelled {
        /// Task ID
        id: TaskId,
    },

    /// A worker lost its lease and the task was redelivered
    WorkerLost {
        /// Task ID
        id: TaskId,
    },

    /// Workflow reached a terminal status
    WorkflowFinished {
        /// Workflow ID
        id: WorkflowId,
        /// Final aggregate status
        status: WorkflowStatus,
    },

    /// Batch reached a terminal status
    BatchFinished {
        /// Batch ID
        id: BatchId,
        /// Final status
        status: BatchStatus,
        /// Items that succeeded
        succeeded: usize,
        /// Items that failed
        failed: usize,
    },

    /// Completion webhook failed
    WebhookFailed {
        /// Webhook URL
        url: String,
        /// Error message
        error: String,
    },

    /// Engine is shutting down
    Shutdown,
}

/// Payload delivered to completion hooks and webhooks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event type (workflow_complete, workflow_failed, batch_complete, batch_failed)
    pub event: String,

    /// "workflow" or "batch"
    pub target: String,

    /// Workflow or batch ID
    pub id: i64,

    /// Final aggregate status
    pub status: String,

    /// Aggregate progress percentage
    pub progress_percent: f64,

    /// Items that succeeded (batches only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeeded_count: Option<usize>,

    /// Items that failed (batches only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_count: Option<usize>,

    /// Percentage of items that succeeded (batches only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,

    /// Final result (workflows only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Human-readable failure detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Timestamp of the event (Unix timestamp in seconds)
    pub timestamp: i64,
}
