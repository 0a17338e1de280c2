//! Heartbeat producer: periodic polling of external sources.
//!
//! Every tick, each registered check lists what currently needs attention
//! (review requests, open tickets, failing health checks). Items already seen
//! within the heartbeat TTL are skipped; the rest become work items. An item
//! whose condition persists past the TTL is surfaced again on a later tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dedup::IdempotencyCache;
use crate::error::TaskError;
use crate::queue::{Producer, TaskQueue, WorkItem};

/// An external item found by a heartbeat check.
#[derive(Debug, Clone)]
pub struct DiscoveredItem {
    pub id: String,
    pub payload: serde_json::Value,
}

impl DiscoveredItem {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// One polled source.
#[async_trait]
pub trait HeartbeatCheck: Send + Sync {
    /// Source tag, prefixed to item ids for dedup and queue keys.
    fn source(&self) -> &str;

    /// List items that currently need attention.
    async fn discover(&self) -> Result<Vec<DiscoveredItem>, TaskError>;

    /// Body of the work item for one discovered item.
    async fn handle(&self, item: DiscoveredItem) -> Result<(), TaskError>;
}

/// Runs all checks on each tick and admits new items.
pub struct HeartbeatPoller {
    queue: Arc<TaskQueue>,
    seen: Arc<IdempotencyCache>,
    checks: Vec<Arc<dyn HeartbeatCheck>>,
}

impl HeartbeatPoller {
    pub fn new(queue: Arc<TaskQueue>, seen: Arc<IdempotencyCache>) -> Self {
        Self {
            queue,
            seen,
            checks: Vec::new(),
        }
    }

    /// Register a check.
    pub fn with_check(mut self, check: Arc<dyn HeartbeatCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Number of registered checks.
    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    /// Run every check once. Returns the number of work items admitted.
    pub async fn tick(&self) -> usize {
        let mut admitted = 0;

        for check in &self.checks {
            let source = check.source().to_string();
            let items = match check.discover().await {
                Ok(items) => items,
                Err(e) => {
                    warn!(source = %source, error = %e, "Heartbeat check failed");
                    continue;
                }
            };

            for item in items {
                let key = format!("{source}:{}", item.id);
                if !self.seen.check_and_mark(&key) {
                    debug!(key = %key, "Already seen, skipped");
                    continue;
                }

                let body_check = Arc::clone(check);
                let work = WorkItem::new(key.clone(), Producer::Heartbeat, async move {
                    body_check.handle(item).await
                });
                if self.queue.enqueue(work) {
                    admitted += 1;
                }
            }
        }

        if admitted > 0 {
            info!(admitted, "Heartbeat admitted new work");
        }
        admitted
    }
}

/// Spawn the heartbeat loop. The first tick runs immediately.
pub fn spawn_heartbeat_loop(poller: Arc<HeartbeatPoller>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            checks = poller.check_count(),
            "Heartbeat loop started (interval: {}s)",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            poller.tick().await;
        }
    })
}
