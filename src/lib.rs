//! Agent Dispatch: admission and deduplication for agent work.
//!
//! Webhooks, a heartbeat poll, and cron jobs all feed one bounded task queue.
//! The queue guarantees a key never runs twice at once and at most N items
//! run system-wide; per-producer idempotency caches keep repeat events from
//! building work items in the first place.

pub mod api;
pub mod config;
pub mod dedup;
pub mod error;
pub mod producers;
pub mod queue;
pub mod runner;
pub mod schedule;
