//! Work item types and the task phase state machine.

use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// The body of a work item. Futures are lazy, so nothing runs until the
/// queue polls it from an execution slot.
pub type TaskBody = BoxFuture<'static, Result<(), TaskError>>;

/// Which producer admitted a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    /// GitHub webhook deliveries.
    #[serde(rename = "github")]
    GitHub,
    /// Linear webhook deliveries.
    Linear,
    /// The periodic heartbeat poll.
    Heartbeat,
    /// A cron job firing.
    Cron,
}

impl Producer {
    /// Webhook producers, keyed by their route segment.
    pub fn webhook_source(source: &str) -> Option<Self> {
        source
            .parse::<Self>()
            .ok()
            .filter(|producer| producer.delivery_header().is_some())
    }

    /// Header carrying the delivery id for webhook producers.
    pub fn delivery_header(&self) -> Option<&'static str> {
        match self {
            Producer::GitHub => Some("x-github-delivery"),
            Producer::Linear => Some("linear-delivery"),
            Producer::Heartbeat | Producer::Cron => None,
        }
    }
}

impl std::fmt::Display for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Producer::GitHub => write!(f, "github"),
            Producer::Linear => write!(f, "linear"),
            Producer::Heartbeat => write!(f, "heartbeat"),
            Producer::Cron => write!(f, "cron"),
        }
    }
}

impl FromStr for Producer {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Producer::GitHub),
            "linear" => Ok(Producer::Linear),
            "heartbeat" => Ok(Producer::Heartbeat),
            "cron" => Ok(Producer::Cron),
            other => Err(format!("unknown producer: {other}")),
        }
    }
}

/// Lifecycle of a key inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Admitted, waiting for a slot.
    Pending,
    /// Holding a slot; body is running.
    Active,
    /// Body settled. The key is released.
    Done,
}

impl TaskPhase {
    /// Check if this phase allows moving to `target`.
    pub fn can_transition_to(&self, target: TaskPhase) -> bool {
        use TaskPhase::*;

        matches!((self, target), (Pending, Active) | (Active, Done))
    }

    /// Check if the phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// How a body settled. The queue treats both the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed { reason: String },
}

/// One admitted unit of work. Immutable once built; the queue owns it from
/// admission until its body settles.
pub struct WorkItem {
    pub key: String,
    pub producer: Producer,
    pub body: TaskBody,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Build a work item from any sendable future.
    pub fn new<F>(key: impl Into<String>, producer: Producer, body: F) -> Self
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            producer,
            body: body.boxed(),
            created_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("key", &self.key)
            .field("producer", &self.producer)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
