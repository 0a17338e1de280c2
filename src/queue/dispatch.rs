//! Task queue: the single admission chokepoint for every producer.
//!
//! Keys move through `TaskPhase::Pending → Active → Done`. The phase index is
//! the only authority on "is this key in flight"; a key is released (removed
//! from the index) when its body settles. All transitions happen under one
//! synchronous lock and never across an `.await`, so no caller can observe a
//! key that is both pending and active, or more active keys than the ceiling.
//!
//! Finishing a body is what admits the next pending item. There is no poller.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::task::{Producer, TaskOutcome, TaskPhase, WorkItem};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Lifecycle events, fanned out to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Admitted { key: String, producer: Producer },
    Started {
        key: String,
        producer: Producer,
        /// When the item was built, so observers can see queue wait.
        queued_at: DateTime<Utc>,
    },
    Finished { key: String, outcome: TaskOutcome },
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub max_concurrent: usize,
    pub pending_count: usize,
    pub active_count: usize,
    /// Active keys in start order.
    pub active_keys: Vec<String>,
    /// Pending keys in admission order.
    pub pending_keys: Vec<String>,
}

/// A key currently holding a slot.
#[derive(Debug, Clone)]
struct ActiveTask {
    key: String,
    producer: Producer,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    phases: HashMap<String, TaskPhase>,
    pending: VecDeque<WorkItem>,
    active: Vec<ActiveTask>,
}

impl QueueState {
    fn transition(&mut self, key: &str, target: TaskPhase) {
        let current = self.phases.get(key).copied();
        debug_assert!(
            current.is_some_and(|p| p.can_transition_to(target)),
            "illegal transition for {key}: {current:?} -> {target}"
        );
        if target.is_terminal() {
            self.phases.remove(key);
        } else {
            self.phases.insert(key.to_string(), target);
        }
    }
}

/// Bounded-concurrency FIFO queue of opaque work items.
///
/// Must be used from within a Tokio runtime; bodies run on spawned tasks.
pub struct TaskQueue {
    max_concurrent: usize,
    state: Mutex<QueueState>,
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskQueue {
    /// Create a queue with a fixed ceiling. A ceiling of zero is raised to one.
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(QueueState::default()),
            tx,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// The configured concurrency ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Admit a work item.
    ///
    /// Returns `false` without side effects when the key is empty or already
    /// pending or active. That is "already in flight", not an error.
    pub fn enqueue(self: &Arc<Self>, item: WorkItem) -> bool {
        if item.key.is_empty() {
            warn!(producer = %item.producer, "Rejected work item with empty key");
            return false;
        }

        let ready = {
            let mut state = self.lock();
            if let Some(phase) = state.phases.get(&item.key) {
                debug!(key = %item.key, producer = %item.producer, phase = %phase, "Duplicate key, not admitted");
                return false;
            }

            state.phases.insert(item.key.clone(), TaskPhase::Pending);
            let _ = self.tx.send(TaskEvent::Admitted {
                key: item.key.clone(),
                producer: item.producer,
            });
            debug!(key = %item.key, producer = %item.producer, "Work item admitted");
            state.pending.push_back(item);

            self.take_ready(&mut state)
        };

        self.spawn_all(ready);
        true
    }

    /// Snapshot of pending and active keys.
    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            max_concurrent: self.max_concurrent,
            pending_count: state.pending.len(),
            active_count: state.active.len(),
            active_keys: state.active.iter().map(|t| t.key.clone()).collect(),
            pending_keys: state.pending.iter().map(|i| i.key.clone()).collect(),
        }
    }

    /// Current phase of a key, `None` once it is done or was never admitted.
    pub fn phase(&self, key: &str) -> Option<TaskPhase> {
        self.lock().phases.get(key).copied()
    }

    /// Check if a key is currently executing.
    pub fn is_active(&self, key: &str) -> bool {
        self.phase(key) == Some(TaskPhase::Active)
    }

    /// Check if a key is waiting for a slot.
    pub fn is_pending(&self, key: &str) -> bool {
        self.phase(key) == Some(TaskPhase::Pending)
    }

    /// Move pending items into free slots, oldest first. Returns the items
    /// whose bodies must now be spawned.
    fn take_ready(&self, state: &mut QueueState) -> Vec<WorkItem> {
        let mut ready = Vec::new();
        while state.active.len() < self.max_concurrent {
            let Some(item) = state.pending.pop_front() else {
                break;
            };

            let started_at = Utc::now();
            state.transition(&item.key, TaskPhase::Active);
            state.active.push(ActiveTask {
                key: item.key.clone(),
                producer: item.producer,
                started_at,
            });
            debug!(
                key = %item.key,
                waited_ms = (started_at - item.created_at).num_milliseconds(),
                "Slot acquired"
            );
            let _ = self.tx.send(TaskEvent::Started {
                key: item.key.clone(),
                producer: item.producer,
                queued_at: item.created_at,
            });
            ready.push(item);
        }
        ready
    }

    fn spawn_all(self: &Arc<Self>, ready: Vec<WorkItem>) {
        for item in ready {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.run(item).await;
            });
        }
    }

    async fn run(self: Arc<Self>, item: WorkItem) {
        let WorkItem {
            key,
            producer,
            body,
            ..
        } = item;
        let start = Instant::now();
        info!(key = %key, producer = %producer, "Task started");

        let outcome = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(())) => {
                info!(key = %key, producer = %producer, elapsed_ms = start.elapsed().as_millis() as u64, "Task finished");
                TaskOutcome::Succeeded
            }
            Ok(Err(e)) => {
                error!(key = %key, producer = %producer, error = %e, "Task failed");
                TaskOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(key = %key, producer = %producer, panic = %reason, "Task panicked");
                TaskOutcome::Failed { reason }
            }
        };

        self.complete(&key, outcome);
    }

    /// Release a finished key and refill the freed slot.
    fn complete(self: &Arc<Self>, key: &str, outcome: TaskOutcome) {
        let ready = {
            let mut state = self.lock();
            if let Some(pos) = state.active.iter().position(|t| t.key == key) {
                let task = state.active.remove(pos);
                let held_for = Utc::now().signed_duration_since(task.started_at);
                debug!(key = %key, producer = %task.producer, held_ms = held_for.num_milliseconds(), "Slot released");
            }
            state.transition(key, TaskPhase::Done);
            let _ = self.tx.send(TaskEvent::Finished {
                key: key.to_string(),
                outcome,
            });

            self.take_ready(&mut state)
        };

        self.spawn_all(ready);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
