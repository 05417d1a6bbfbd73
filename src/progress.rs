//! Progress tracking for running tasks and aggregate ratios for workflows and batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::types::{Event, TaskId};

/// Latest progress reported by a task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Units done
    pub current: u64,
    /// Units in total (0 = unknown)
    pub total: u64,
    /// Optional stage description
    pub message: Option<String>,
    /// When the update was recorded
    pub updated_at: DateTime<Utc>,
}

impl ProgressUpdate {
    /// Completion percentage, clamped to 0..=100; 0 while the total is unknown
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        percent(self.current as usize, self.total as usize)
    }
}

/// Keeps only the latest update per task
#[derive(Debug, Default)]
pub struct ProgressTracker {
    latest: Mutex<HashMap<TaskId, ProgressUpdate>>,
}

impl ProgressTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update; returns None when it would move progress backwards
    /// and was ignored
    pub fn record(
        &self,
        id: TaskId,
        current: u64,
        total: u64,
        message: Option<String>,
    ) -> Option<ProgressUpdate> {
        let update = ProgressUpdate {
            current,
            total,
            message,
            updated_at: Utc::now(),
        };
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = latest.get(&id)
            && update.percent() < previous.percent()
        {
            tracing::debug!(task_id = %id, "Ignoring out-of-order progress update");
            return None;
        }
        latest.insert(id, update.clone());
        Some(update)
    }

    /// Latest update for a task
    pub fn get(&self, id: TaskId) -> Option<ProgressUpdate> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Forget a task's progress (new attempt or terminal)
    pub fn clear(&self, id: TaskId) {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Handle given to a running handler for reporting progress
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    id: TaskId,
    tracker: Arc<ProgressTracker>,
    event_tx: broadcast::Sender<Event>,
}

impl ProgressReporter {
    pub(crate) fn new(
        id: TaskId,
        tracker: Arc<ProgressTracker>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            id,
            tracker,
            event_tx,
        }
    }

    /// Report `current` of `total` units done
    pub fn report(&self, current: u64, total: u64, message: Option<&str>) {
        if let Some(update) =
            self.tracker
                .record(self.id, current, total, message.map(str::to_string))
        {
            self.event_tx
                .send(Event::TaskProgress {
                    id: self.id,
                    percent: update.percent(),
                    message: update.message,
                })
                .ok();
        }
    }
}

/// `100 * done / total`, with an empty set counting as complete
pub fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (100.0 * done as f64 / total as f64).clamp(0.0, 100.0)
}
