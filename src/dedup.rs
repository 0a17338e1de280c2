//! Idempotency caches: TTL-bounded "already seen" sets for producers.
//!
//! A producer checks its cache before building a work item so that the same
//! delivery or the same discovered item does not cost another lookup or
//! another thread in the chat surface. The cache is advisory only; the task
//! queue's key check is the authoritative gate.
//!
//! Entries expire after a fixed TTL. A persisting external condition (a PR
//! still open, a health check still failing) is allowed to surface again once
//! its entry has expired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// TTL-bounded set of external identifiers.
pub struct IdempotencyCache {
    name: &'static str,
    ttl: Duration,
    /// External id → first time it was seen.
    entries: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyCache {
    /// Create a cache whose entries live for `ttl`.
    pub fn new(name: &'static str, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Cache name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Check whether `id` was seen within the TTL.
    pub fn seen(&self, id: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(id)
            .is_some_and(|first_seen| !self.is_expired(*first_seen, now))
    }

    /// Record `id` as seen. An unexpired entry keeps its original timestamp.
    pub fn mark_seen(&self, id: &str) {
        self.check_and_mark(id);
    }

    /// Record `id` and report whether it is new. Returns `false` when `id`
    /// was already seen within the TTL.
    pub fn check_and_mark(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(id) {
            Some(first_seen) if !self.is_expired(*first_seen, now) => false,
            _ => {
                entries.insert(id.to_string(), now);
                true
            }
        }
    }

    /// Drop entries older than the TTL. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, first_seen| !self.is_expired(*first_seen, now));
        let removed = before - entries.len();

        if removed > 0 {
            info!(cache = self.name, removed, remaining = entries.len(), "Swept idempotency cache");
        } else {
            debug!(cache = self.name, remaining = entries.len(), "Idempotency cache sweep: nothing expired");
        }
        removed
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn is_expired(&self, first_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(first_seen) >= self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Spawn a background task that sweeps `cache` every `period`.
pub fn spawn_sweep_task(
    cache: Arc<IdempotencyCache>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        debug!(
            cache = cache.name(),
            ttl_secs = cache.ttl().as_secs(),
            "Sweep task started (every {}s)",
            period.as_secs()
        );
        let mut interval = tokio::time::interval(period);
        // Skip immediate first tick
        interval.tick().await;

        loop {
            interval.tick().await;
            cache.sweep();
        }
    })
}
