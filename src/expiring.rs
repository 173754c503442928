//! A concurrent map whose entries expire a fixed time after their last write.
//!
//! Backs both the dedup filter and the in-memory session store. Expired
//! entries are invisible to readers immediately and are physically removed by
//! [`ExpiringMap::sweep_at`], which callers run opportunistically.

use std::{
    borrow::Borrow,
    hash::Hash,
    time::{Duration, Instant},
};

use dashmap::{mapref::entry::Entry as MapEntry, DashMap};

/// Longest window an entry can live. Larger TTLs are clamped to it so that
/// deadline arithmetic on [`Instant`] cannot overflow.
pub(crate) const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
pub(crate) struct ExpiringMap<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: ttl.min(MAX_TTL),
        }
    }

    fn deadline(&self, now: Instant) -> Instant {
        now.checked_add(self.ttl).unwrap_or(now)
    }

    /// Returns a copy of the value under `key` if it is still live at `now`.
    pub(crate) fn get_at<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.get(key)?;
        entry.is_live(now).then(|| entry.value.clone())
    }

    /// Inserts or replaces `key`, restarting its expiry window.
    pub(crate) fn insert_at(&self, key: K, value: V, now: Instant) {
        let expires_at = self.deadline(now);
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Inserts `key` only if no live entry exists. Returns `true` if inserted.
    ///
    /// The check and the insert happen under the shard lock, so of two
    /// concurrent callers with the same key exactly one wins.
    pub(crate) fn insert_if_absent_at(&self, key: K, value: V, now: Instant) -> bool {
        let fresh = Entry {
            value,
            expires_at: self.deadline(now),
        };
        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }

    /// Physically drops every entry expired at `now`.
    pub(crate) fn sweep_at(&self, now: Instant) {
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
