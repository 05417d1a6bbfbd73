//! Queue client: named priority/time-ordered queues with leased delivery
//!
//! Within a queue, tasks are offered by `(not_before ascending, priority
//! descending, enqueue order ascending)`, where a task without `not_before`
//! sorts ahead of every delayed task. A delayed task stays invisible until its
//! `not_before` passes.
//!
//! Delivery is at-least-once: a dequeue hands out a lease identified by a
//! delivery tag. Exactly one worker holds the lease for a task; if it is not
//! acked or nacked within the lease timeout, [`QueueClient::reclaim_expired`]
//! makes the task visible again without consuming a retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result, TaskError};
use crate::store::RecordStore;
use crate::task::Task;
use crate::types::{Priority, TaskId};

/// A task handed to a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Task ID
    pub task_id: TaskId,
    /// Queue the task came from
    pub queue: String,
    /// Delivery tag; acks and nacks must present it
    pub tag: u64,
}

/// Point-in-time view of one queue
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name
    pub name: String,
    /// Tasks a worker could take right now
    pub ready: usize,
    /// Tasks waiting for their eta or backoff to pass
    pub delayed: usize,
    /// Tasks leased to workers
    pub leased: usize,
}

/// What happened to a task whose lease expired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reclaimed {
    /// Visible again, attempt unchanged
    Requeued {
        /// Task ID
        id: TaskId,
        /// Tag of the delivery whose lease expired
        tag: u64,
    },
    /// A cancel was pending, so the task was cancelled instead
    Cancelled(TaskId),
}

/// Internal struct representing a task in a queue's heap
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedTask {
    id: TaskId,
    priority: Priority,
    visible_at: Option<Instant>,
    seq: u64,
}

// BinaryHeap is a max-heap, so "greater" means "served first"
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_time = match (self.visible_at, other.visible_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => b.cmp(&a),
        };
        by_time
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Lease {
    tag: u64,
    queue: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<String, BinaryHeap<QueuedTask>>,
    leases: HashMap<TaskId, Lease>,
    next_seq: u64,
    next_tag: u64,
}

impl QueueState {
    fn push(&mut self, queue: &str, id: TaskId, priority: Priority, visible_at: Option<Instant>) -> Result<()> {
        let seq = self.next_seq;
        let heap = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::UnknownQueue(queue.to_string()))?;
        heap.push(QueuedTask {
            id,
            priority,
            visible_at,
            seq,
        });
        self.next_seq += 1;
        Ok(())
    }

    fn release(&mut self, id: TaskId, tag: u64) -> bool {
        if self.leases.get(&id).is_some_and(|l| l.tag == tag) {
            self.leases.remove(&id);
            true
        } else {
            false
        }
    }
}

/// Named queues over the shared task store
#[derive(Debug)]
pub struct QueueClient {
    state: Mutex<QueueState>,
    tasks: Arc<RecordStore<TaskId, Task>>,
    notify: Notify,
    lease_timeout: Duration,
}

impl QueueClient {
    /// Create the client with a fixed set of queue names
    pub fn new<I, S>(names: I, tasks: Arc<RecordStore<TaskId, Task>>, lease_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = QueueState {
            queues: names
                .into_iter()
                .map(|n| (n.into(), BinaryHeap::new()))
                .collect(),
            ..QueueState::default()
        };
        Self {
            state: Mutex::new(state),
            tasks,
            notify: Notify::new(),
            lease_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `name` is a known queue
    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Store a new task record and make it available to workers
    ///
    /// An `eta` in the future marks the task Scheduled and hides it until then.
    pub fn enqueue(&self, mut task: Task, eta: Option<DateTime<Utc>>) -> Result<TaskId> {
        let delay = eta
            .and_then(|eta| (eta - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero());
        if let Some(delay) = delay {
            task.schedule(Utc::now() + chrono_delta(delay))?;
        }

        let id = task.id;
        let visible_at = delay.map(|d| Instant::now() + d);
        {
            let mut state = self.lock();
            state.push(&task.queue, id, task.priority, visible_at)?;
            tracing::debug!(task_id = %id, queue = %task.queue, delayed = delay.is_some(), "Task enqueued");
            self.tasks.insert(id, task);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Put an already-stored, waiting task back on its queue after `delay`
    pub fn requeue(&self, id: TaskId, delay: Duration) -> Result<()> {
        let task = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !task.status.is_waiting() {
            return Err(Error::invalid_state(id, "requeue", task.status));
        }
        self.lock().push(
            &task.queue,
            id,
            task.priority,
            Some(Instant::now() + delay),
        )?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Take up to `capacity` visible tasks from the named queues, waiting up to
    /// `wait` for one to appear
    ///
    /// Each returned task has been moved to Running under a fresh lease.
    pub async fn dequeue(&self, queue_names: &[String], capacity: usize, wait: Duration) -> Vec<Delivery> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before looking so a concurrent enqueue is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (deliveries, next_visible) = self.try_dequeue(queue_names, capacity.max(1));
            if !deliveries.is_empty() {
                return deliveries;
            }
            if Instant::now() >= deadline {
                return deliveries;
            }

            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn try_dequeue(&self, queue_names: &[String], capacity: usize) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut deliveries = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for name in queue_names {
            let Some(heap) = state.queues.get_mut(name) else {
                continue;
            };
            while deliveries.len() < capacity {
                let Some(head) = heap.peek() else {
                    break;
                };
                if let Some(at) = head.visible_at
                    && at > now
                {
                    next_visible = Some(next_visible.map_or(at, |n| n.min(at)));
                    break;
                }
                let Some(entry) = heap.pop() else {
                    break;
                };

                let tag = state.next_tag;
                state.next_tag += 1;
                let started = self
                    .tasks
                    .update(entry.id, |t| {
                        t.status.is_waiting() && !t.cancel_requested && t.start(tag).is_ok()
                    })
                    .unwrap_or(false);
                if !started {
                    // cancelled or already settled while queued
                    continue;
                }

                state.leases.insert(
                    entry.id,
                    Lease {
                        tag,
                        queue: name.clone(),
                        expires_at: now + self.lease_timeout,
                    },
                );
                deliveries.push(Delivery {
                    task_id: entry.id,
                    queue: name.clone(),
                    tag,
                });
            }
        }

        (deliveries, next_visible)
    }

    /// Settle a delivery; false if the lease was already lost
    pub fn ack(&self, id: TaskId, tag: u64) -> bool {
        self.lock().release(id, tag)
    }

    /// Give a delivery back, recording `reason` as the task's last error
    ///
    /// With `requeue` the task becomes visible again immediately without
    /// consuming a retry. Without it the task fails terminally; the caller owns
    /// any follow-up for its parent. Returns false if the lease was already lost.
    pub fn nack(&self, id: TaskId, tag: u64, requeue: bool, reason: TaskError) -> bool {
        let requeued = {
            let mut state = self.lock();
            if !state.release(id, tag) {
                return false;
            }
            let updated = self.tasks.update(id, |t| {
                if !t.holds_delivery(tag) {
                    return None;
                }
                if requeue {
                    t.retry(reason, false, Utc::now())
                        .ok()
                        .map(|_| (t.queue.clone(), t.priority))
                } else {
                    t.fail(reason).ok();
                    None
                }
            });
            match updated.flatten() {
                Some((queue, priority)) => {
                    state.push(&queue, id, priority, Some(Instant::now())).is_ok()
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
        true
    }

    /// Requeue every task whose lease has expired
    pub fn reclaim_expired(&self) -> Vec<Reclaimed> {
        let now = Instant::now();
        let mut reclaimed = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let expired: Vec<TaskId> = state
                .leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                let Some(lease) = state.leases.remove(&id) else {
                    continue;
                };
                let outcome = self.tasks.update(id, |t| {
                    if !t.holds_delivery(lease.tag) {
                        return None;
                    }
                    if t.cancel_requested {
                        return t.cancel().ok().map(|_| Reclaimed::Cancelled(id));
                    }
                    t.retry(TaskError::worker_lost("lease expired"), false, Utc::now())
                        .ok()
                        .map(|_| Reclaimed::Requeued { id, tag: lease.tag })
                });
                match outcome.flatten() {
                    Some(requeued @ Reclaimed::Requeued { .. }) => {
                        let priority = self.tasks.get(id).map(|t| t.priority).unwrap_or_default();
                        if state.push(&lease.queue, id, priority, Some(now)).is_ok() {
                            tracing::warn!(task_id = %id, queue = %lease.queue, "Lease expired, task redelivered");
                            reclaimed.push(requeued);
                        }
                    }
                    Some(cancelled) => reclaimed.push(cancelled),
                    None => {}
                }
            }
        }
        if !reclaimed.is_empty() {
            self.notify.notify_waiters();
        }
        reclaimed
    }

    /// Drop a waiting task from its queue; true if it was queued
    pub fn remove(&self, id: TaskId) -> bool {
        let mut state = self.lock();
        let mut removed = false;
        for heap in state.queues.values_mut() {
            let before = heap.len();
            heap.retain(|entry| entry.id != id);
            removed |= heap.len() != before;
        }
        removed
    }

    /// Whether a delivery still holds its lease
    pub fn holds_lease(&self, id: TaskId, tag: u64) -> bool {
        self.lock().leases.get(&id).is_some_and(|l| l.tag == tag)
    }

    /// Per-queue counts, sorted by queue name
    pub fn stats(&self) -> Vec<QueueStats> {
        let now = Instant::now();
        let state = self.lock();
        let mut stats: Vec<QueueStats> = state
            .queues
            .iter()
            .map(|(name, heap)| {
                let delayed = heap
                    .iter()
                    .filter(|e| e.visible_at.is_some_and(|at| at > now))
                    .count();
                QueueStats {
                    name: name.clone(),
                    ready: heap.len() - delayed,
                    delayed,
                    leased: state.leases.values().filter(|l| &l.queue == name).count(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

fn chrono_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}
