//! Webhook producer: verified deliveries in, work items out.
//!
//! Deliveries are deduplicated on their delivery id before a work item is
//! built. Providers redeliver on timeouts, so a repeat is acknowledged as
//! accepted-but-skipped rather than rejected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::dedup::IdempotencyCache;
use crate::error::TaskError;
use crate::queue::{Producer, TaskQueue, WorkItem};

/// Turns a verified webhook payload into work.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Queue key for the work this payload asks for, `None` when the event
    /// needs no work. Two deliveries about the same logical unit of work
    /// must map to the same key.
    fn work_key(&self, payload: &serde_json::Value) -> Option<String>;

    /// Body of the work item.
    async fn handle(&self, payload: serde_json::Value) -> Result<(), TaskError>;
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A new work item was admitted.
    Accepted { key: String },
    /// This delivery id was already handled.
    Duplicate,
    /// No handler, or the event needs no work.
    Ignored,
    /// The work key is already pending or running.
    AlreadyQueued { key: String },
}

/// Admission front door for webhook producers.
pub struct WebhookIntake {
    queue: Arc<TaskQueue>,
    deliveries: Arc<IdempotencyCache>,
    handlers: HashMap<Producer, Arc<dyn EventHandler>>,
}

impl WebhookIntake {
    pub fn new(queue: Arc<TaskQueue>, deliveries: Arc<IdempotencyCache>) -> Self {
        Self {
            queue,
            deliveries,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a webhook source.
    pub fn with_handler(mut self, producer: Producer, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(producer, handler);
        self
    }

    /// Check if a source has a registered handler.
    pub fn has_handler(&self, producer: Producer) -> bool {
        self.handlers.contains_key(&producer)
    }

    /// Handle one verified delivery.
    pub fn accept(
        &self,
        producer: Producer,
        delivery_id: &str,
        payload: serde_json::Value,
    ) -> WebhookOutcome {
        let Some(handler) = self.handlers.get(&producer) else {
            debug!(producer = %producer, "No handler for webhook source");
            return WebhookOutcome::Ignored;
        };

        if !self.deliveries.check_and_mark(delivery_id) {
            info!(producer = %producer, delivery_id = %delivery_id, "Duplicate delivery skipped");
            return WebhookOutcome::Duplicate;
        }

        let Some(key) = handler.work_key(&payload) else {
            debug!(producer = %producer, delivery_id = %delivery_id, "Delivery needs no work");
            return WebhookOutcome::Ignored;
        };

        let body_handler = Arc::clone(handler);
        let item = WorkItem::new(key.clone(), producer, async move {
            body_handler.handle(payload).await
        });

        if self.queue.enqueue(item) {
            info!(producer = %producer, delivery_id = %delivery_id, key = %key, "Webhook admitted");
            WebhookOutcome::Accepted { key }
        } else {
            debug!(producer = %producer, key = %key, "Webhook work already in flight");
            WebhookOutcome::AlreadyQueued { key }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;

    /// Keys on `pr`, blocks until released.
    struct PrHandler {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EventHandler for PrHandler {
        fn work_key(&self, payload: &serde_json::Value) -> Option<String> {
            payload
                .get("pr")
                .and_then(|v| v.as_u64())
                .map(|n| format!("pr-review:{n}"))
        }

        async fn handle(&self, _payload: serde_json::Value) -> Result<(), TaskError> {
            self.release.notified().await;
            Ok(())
        }
    }

    fn intake() -> (WebhookIntake, Arc<TaskQueue>) {
        let queue = TaskQueue::new(2);
        let cache = IdempotencyCache::new("webhook", Duration::from_secs(600));
        let handler = Arc::new(PrHandler {
            release: Arc::new(Notify::new()),
        });
        let intake =
            WebhookIntake::new(Arc::clone(&queue), cache).with_handler(Producer::GitHub, handler);
        (intake, queue)
    }

    #[tokio::test]
    async fn new_delivery_is_admitted() {
        let (intake, queue) = intake();
        let outcome = intake.accept(Producer::GitHub, "d-1", serde_json::json!({"pr": 7}));
        assert_eq!(
            outcome,
            WebhookOutcome::Accepted {
                key: "pr-review:7".to_string()
            }
        );
        assert!(queue.is_active("pr-review:7"));
    }

    #[tokio::test]
    async fn redelivery_is_duplicate() {
        let (intake, queue) = intake();
        intake.accept(Producer::GitHub, "d-1", serde_json::json!({"pr": 7}));
        let outcome = intake.accept(Producer::GitHub, "d-1", serde_json::json!({"pr": 7}));
        assert_eq!(outcome, WebhookOutcome::Duplicate);
        assert_eq!(queue.status().active_count, 1);
    }

    #[tokio::test]
    async fn new_delivery_same_work_collides_at_queue() {
        let (intake, _queue) = intake();
        intake.accept(Producer::GitHub, "d-1", serde_json::json!({"pr": 7}));
        let outcome = intake.accept(Producer::GitHub, "d-2", serde_json::json!({"pr": 7}));
        assert_eq!(
            outcome,
            WebhookOutcome::AlreadyQueued {
                key: "pr-review:7".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unhandled_events_are_ignored() {
        let (intake, queue) = intake();
        let no_work = intake.accept(Producer::GitHub, "d-1", serde_json::json!({"action": "x"}));
        assert_eq!(no_work, WebhookOutcome::Ignored);

        let no_handler = intake.accept(Producer::Linear, "d-2", serde_json::json!({"pr": 1}));
        assert_eq!(no_handler, WebhookOutcome::Ignored);
        assert!(!intake.has_handler(Producer::Linear));
        assert_eq!(queue.status().active_count, 0);
    }
}
