//! Core engine implementation split into focused submodules.
//!
//! The `Engine` struct and its methods are organized by domain:
//! - [`submit`] - Task, workflow and batch submission
//! - [`worker`] - Execution of one leased task
//! - [`completion`] - Propagation of terminal outcomes to workflows and batches
//! - [`batch`] - Batch coordinators
//! - [`monitor`] - Status queries, cancellation and manual retry
//! - [`lifecycle`] - Startup and shutdown coordination
//! - [`webhooks`] - Completion notifications

mod batch;
mod completion;
mod lifecycle;
mod monitor;
mod submit;
mod webhooks;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use webhooks::CompletionHook;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchJob;
use crate::composer::WorkflowState;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::progress::ProgressTracker;
use crate::queue::QueueClient;
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;
use crate::store::RecordStore;
use crate::task::Task;
use crate::types::{BatchId, Event, IdAllocator, TaskId};

use webhooks::HookTarget;

/// Lock a runtime map; a poisoned lock only means a panic elsewhere, the map
/// itself is still consistent
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Every handler timeout must end an attempt before its lease expires
fn check_handler_timeouts(config: &Config, registry: &TaskRegistry) -> Result<()> {
    let lease = config.execution.lease_timeout;
    for kind in registry.kinds() {
        let timeout = registry.get(kind).and_then(|h| h.timeout());
        if timeout.is_some_and(|t| t >= lease) {
            return Err(Error::Config {
                message: format!(
                    "handler timeout for {} must be shorter than the lease timeout",
                    kind
                ),
                key: Some("execution.lease_timeout".to_string()),
            });
        }
    }
    Ok(())
}

/// Record stores (the engine's source of truth)
#[derive(Clone)]
pub(crate) struct Records {
    /// Every task ever accepted
    pub(crate) tasks: Arc<RecordStore<TaskId, Task>>,
    /// Workflow trees
    pub(crate) workflows: Arc<RecordStore<crate::types::WorkflowId, WorkflowState>>,
    /// Batch jobs
    pub(crate) batches: Arc<RecordStore<BatchId, BatchJob>>,
    /// Monotonic ID source shared by all record kinds
    pub(crate) ids: Arc<IdAllocator>,
}

/// Worker and coordinator state that only exists while the engine runs
#[derive(Clone)]
pub(crate) struct RuntimeState {
    /// Delivery tag and cancellation token of each handler currently executing
    pub(crate) active: Arc<Mutex<HashMap<TaskId, (u64, CancellationToken)>>>,
    /// Flag to indicate whether new submissions are accepted (false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Set once [`Engine::start`] has spawned the pools
    pub(crate) started: Arc<AtomicBool>,
    /// Parent of every worker, reaper and coordinator token
    pub(crate) shutdown: CancellationToken,
    /// One pool per configured queue
    pub(crate) pools: Arc<Mutex<Vec<Arc<WorkerPool>>>>,
    /// Reaper and other long-running loops
    pub(crate) background: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Concurrency permits held by in-flight batch items, keyed by item task
    pub(crate) batch_permits: Arc<Mutex<HashMap<TaskId, OwnedSemaphorePermit>>>,
    /// Per-batch tokens that stop a coordinator from scheduling more items
    pub(crate) batch_tokens: Arc<Mutex<HashMap<BatchId, CancellationToken>>>,
    /// Per-submission completion hooks, fired at most once
    pub(crate) hooks: Arc<Mutex<HashMap<HookTarget, CompletionHook>>>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            started: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            pools: Arc::new(Mutex::new(Vec::new())),
            background: Arc::new(Mutex::new(Vec::new())),
            batch_permits: Arc::new(Mutex::new(HashMap::new())),
            batch_tokens: Arc::new(Mutex::new(HashMap::new())),
            hooks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Main engine instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Engine {
    /// Configuration (validated at construction)
    pub(crate) config: Arc<Config>,
    /// Handlers by task kind
    pub(crate) registry: Arc<TaskRegistry>,
    /// Named priority queues with leases
    pub(crate) queue: Arc<QueueClient>,
    /// Task, workflow and batch records
    pub(crate) records: Records,
    /// Latest progress of running tasks
    pub(crate) progress: Arc<ProgressTracker>,
    /// Retry decisions for failed executions
    pub(crate) retry_policy: RetryPolicy,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Optional task history archive
    pub(crate) db: Option<Arc<Database>>,
    /// Worker and coordinator state
    pub(crate) runtime: RuntimeState,
}

impl Engine {
    /// Create a new engine
    ///
    /// Validates the configuration, opens the history database when one is
    /// configured and sets up the queues. No worker runs until
    /// [`Engine::start`] is called; submissions made before that wait in
    /// their queues.
    pub async fn new(config: Config, registry: TaskRegistry) -> Result<Self> {
        config.validate()?;
        check_handler_timeouts(&config, &registry)?;

        let db = match &config.persistence.database_path {
            Some(path) => Some(Arc::new(Database::new(path).await?)),
            None => None,
        };

        // Buffer of 1000 events per subscriber before it starts lagging
        let (event_tx, _rx) = broadcast::channel(1000);

        let tasks = Arc::new(RecordStore::new());
        let queue = Arc::new(QueueClient::new(
            config.queues.iter().map(|q| q.name.as_str()),
            tasks.clone(),
            config.execution.lease_timeout,
        ));

        let records = Records {
            tasks,
            workflows: Arc::new(RecordStore::new()),
            batches: Arc::new(RecordStore::new()),
            ids: Arc::new(IdAllocator::new()),
        };

        tracing::info!(
            queues = config.queues.len(),
            handlers = registry.kinds().len(),
            history = db.is_some(),
            "Engine initialized"
        );

        Ok(Self {
            retry_policy: RetryPolicy::new(config.retry.clone()),
            config: Arc::new(config),
            registry: Arc::new(registry),
            queue,
            records,
            progress: Arc::new(ProgressTracker::new()),
            event_tx,
            db,
            runtime: RuntimeState::new(),
        })
    }

    /// Subscribe to engine events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// If a subscriber falls behind by more than 1000 events it receives a
    /// `RecvError::Lagged` error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use clipflow::{Config, Engine, TaskRegistry};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let engine = Engine::new(Config::default(), TaskRegistry::new()).await?;
    ///
    ///     let mut events = engine.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             println!("{:?}", event);
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Engine events as a stream (lagged receivers yield an error item)
    pub fn events(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.event_tx.subscribe())
    }

    /// The configuration the engine runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The history archive, if configured
    pub fn database(&self) -> Option<&Database> {
        self.db.as_deref()
    }

    /// Emit an event; having no subscribers is fine
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
