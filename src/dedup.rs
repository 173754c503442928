//! Inbound message deduplication.
//!
//! Meta redelivers a webhook whenever it does not see a timely `200`, so the
//! same `wamid.` can arrive more than once. [`DedupFilter`] remembers message
//! ids for a trailing window and lets each one through once.
//!
//! This is a single-process filter. Two instances behind a load balancer do
//! not share it.

use std::time::{Duration, Instant};

use crate::expiring::ExpiringMap;

/// Default dedup window.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub struct DedupFilter {
    seen: ExpiringMap<String, ()>,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

impl DedupFilter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: ExpiringMap::new(ttl),
        }
    }

    /// Whether `message_id` was remembered within the window.
    pub fn seen(&self, message_id: &str) -> bool {
        self.seen_at(message_id, Instant::now())
    }

    /// Marks `message_id` as seen for the window.
    pub fn remember(&self, message_id: &str) {
        self.remember_at(message_id, Instant::now())
    }

    /// Atomic `seen` + `remember`: returns `true` exactly once per window for
    /// a given id, even under concurrent redelivery.
    pub fn check_and_remember(&self, message_id: &str) -> bool {
        self.check_and_remember_at(message_id, Instant::now())
    }

    pub(crate) fn seen_at(&self, message_id: &str, now: Instant) -> bool {
        self.seen.sweep_at(now);
        self.seen.get_at(message_id, now).is_some()
    }

    pub(crate) fn remember_at(&self, message_id: &str, now: Instant) {
        self.seen.sweep_at(now);
        self.seen.insert_at(message_id.to_owned(), (), now);
    }

    pub(crate) fn check_and_remember_at(&self, message_id: &str, now: Instant) -> bool {
        self.seen.sweep_at(now);
        self.seen.insert_if_absent_at(message_id.to_owned(), (), now)
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
