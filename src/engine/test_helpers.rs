//! Shared test helpers for creating Engine instances in tests.

use crate::batch::BatchJob;
use crate::composer::WorkflowSnapshot;
use crate::config::{Config, QueueConfig};
use crate::engine::Engine;
use crate::registry::TaskRegistry;
use crate::task::Task;
use crate::types::{BatchId, Event, TaskId, TaskKind, WorkflowId};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;

/// Config with fast polling and short, unjittered backoff
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(100);
    config.retry.jitter = false;
    config.execution.poll_interval = Duration::from_millis(20);
    config.execution.shutdown_timeout = Duration::from_secs(5);
    config
}

/// [`test_config`] with every kind routed to one `default` queue
pub(crate) fn single_queue_config(workers: usize) -> Config {
    let mut config = test_config();
    config.queues = vec![QueueConfig::new("default", workers)];
    config.routes = TaskKind::ALL
        .into_iter()
        .map(|kind| (kind, "default".to_string()))
        .collect();
    config
}

/// Engine over `config` with workers running
pub(crate) async fn start_engine(config: Config, registry: TaskRegistry) -> Engine {
    let engine = Engine::new(config, registry).await.unwrap();
    engine.start().unwrap();
    engine
}

/// Engine over [`test_config`] with workers running
pub(crate) async fn create_test_engine(registry: TaskRegistry) -> Engine {
    start_engine(test_config(), registry).await
}

/// Helper to create a running engine with a history database.
/// Returns the engine and the tempdir (which must be kept alive).
pub(crate) async fn create_test_engine_with_history(
    registry: TaskRegistry,
) -> (Engine, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config();
    config.persistence.database_path = Some(temp_dir.path().join("history.db"));
    (start_engine(config, registry).await, temp_dir)
}

async fn poll<T>(mut check: impl FnMut() -> Option<T>) -> T {
    // 60s of (possibly paused) time
    for _ in 0..6000 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Wait until a task is terminal and return its record
pub(crate) async fn wait_for_task(engine: &Engine, id: TaskId) -> Task {
    poll(|| engine.get_task(id).ok().filter(|t| t.status.is_terminal())).await
}

/// Wait until a workflow is terminal and return its snapshot
pub(crate) async fn wait_for_workflow(engine: &Engine, id: WorkflowId) -> WorkflowSnapshot {
    poll(|| engine.get_workflow(id).ok().filter(|w| w.status.is_terminal())).await
}

/// Wait until a batch is terminal and return it
pub(crate) async fn wait_for_batch(engine: &Engine, id: BatchId) -> BatchJob {
    poll(|| engine.get_batch(id).ok().filter(|b| b.status.is_terminal())).await
}

/// Wait until `condition` holds
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    poll(|| condition().then_some(())).await
}

/// Everything currently buffered on a receiver
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
