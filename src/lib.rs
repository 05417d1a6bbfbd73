//! # clipflow
//!
//! Workflow orchestration and task execution for multi-stage content
//! pipelines (ingest, extract, transcribe, rewrite, synthesize, publish).
//!
//! ## Design Philosophy
//!
//! clipflow is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Composable** - Tasks combine into chains, groups and chords
//! - **At-least-once** - Leased deliveries are redelivered if a worker goes quiet
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use clipflow::{
//!     Composition, Config, Engine, TaskContext, TaskError, TaskKind, TaskRegistry, TaskRequest,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = TaskRegistry::new()
//!         .register_fn(TaskKind::Transcribe, |ctx: TaskContext| async move {
//!             ctx.progress.report(1, 2, Some("decoding"));
//!             Ok::<_, TaskError>(json!({ "text": "hello" }))
//!         })
//!         .register_fn(TaskKind::RewriteScript, |ctx: TaskContext| async move {
//!             Ok::<_, TaskError>(json!({ "script": ctx.arg(0).cloned() }))
//!         });
//!
//!     let engine = Engine::new(Config::default(), registry).await?;
//!     engine.start()?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let workflow = engine.submit_workflow(Composition::chain([
//!         Composition::task(TaskRequest::new(TaskKind::Transcribe)),
//!         Composition::task(TaskRequest::new(TaskKind::RewriteScript)),
//!     ]))?;
//!     println!("{:?}", engine.get_workflow(workflow)?.status);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Batch job records
pub mod batch;
/// Workflow composition (chain, group, chord)
pub mod composer;
/// Configuration types
pub mod config;
/// Task history archive
pub mod db;
/// Orchestration engine (decomposed into focused submodules)
pub mod engine;
/// Error types
pub mod error;
/// Worker pools
pub mod pool;
/// Progress tracking
pub mod progress;
/// Leased priority queues
pub mod queue;
/// Task handler registry
pub mod registry;
/// Retry logic with exponential backoff
pub mod retry;
/// In-memory record store
pub mod store;
/// Task records and submission requests
pub mod task;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use batch::{BatchJob, BatchRequest, ItemOutcome, ItemStatus};
pub use composer::{Composition, GroupFailurePolicy, StepSnapshot, WorkflowSnapshot};
pub use config::{Config, QueueConfig, RetryConfig, WebhookConfig, WebhookEvent};
pub use db::{Database, TaskHistoryEntry};
pub use engine::{CompletionHook, Engine};
pub use error::{Error, FailureKind, Result, TaskError};
pub use pool::PoolStats;
pub use progress::{ProgressReporter, ProgressUpdate};
pub use queue::QueueStats;
pub use registry::{TaskContext, TaskHandler, TaskRegistry};
pub use task::{Task, TaskInput, TaskRequest};
pub use types::{
    BatchId, BatchStatus, Event, Priority, TaskId, TaskKind, TaskStatus, WebhookPayload,
    WorkflowId, WorkflowStatus,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use clipflow::{Config, Engine, TaskRegistry, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(Config::default(), TaskRegistry::new()).await?;
///     engine.start()?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(engine).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: Engine) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
