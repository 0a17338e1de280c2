//! Producers that feed the task queue.
//!
//! Each producer pre-filters with its own idempotency cache, then offers
//! work to the shared `TaskQueue`, which has the final word on duplicates.

pub mod heartbeat;
pub mod webhook;

pub use heartbeat::{DiscoveredItem, HeartbeatCheck, HeartbeatPoller, spawn_heartbeat_loop};
pub use webhook::{EventHandler, WebhookIntake, WebhookOutcome};
