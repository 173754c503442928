//! Per-sender conversation state.
//!
//! A [`Session`] is the progress of one sender through the intake flow. The
//! [`SessionStore`] trait is the seam for where sessions live; the crate ships
//! [`InMemorySessionStore`], which forgets a session after a period of
//! inactivity.
//!
//! [`SenderLocks`] serializes processing per sender so that two deliveries for
//! the same sender never interleave their read-modify-write of a session. It
//! only covers a single process.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    expiring::ExpiringMap,
    intake::{Slot, Step},
};

/// Default inactivity window after which a session is forgotten.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub sender_id: String,
    pub step: Step,
    pub answers: HashMap<Slot, String>,
    pub last_touched_at: DateTime<Utc>,
}

impl Session {
    /// A fresh session at `step` with no answers.
    pub fn new(sender_id: impl Into<String>, step: Step) -> Self {
        Self {
            sender_id: sender_id.into(),
            step,
            answers: HashMap::new(),
            last_touched_at: Utc::now(),
        }
    }

    /// Drops every answer and moves back to `step`.
    pub fn restart(&mut self, step: Step) {
        self.step = step;
        self.answers.clear();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_touched_at = Utc::now();
    }

    pub fn is_completed(&self) -> bool {
        self.step.is_terminal()
    }

    /// Time since the last accepted message, as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_touched_at).to_std().unwrap_or_default()
    }
}

/// Where sessions live between messages.
///
/// Implementations must treat a session idle for longer than their
/// inactivity window as absent.
pub trait SessionStore: Send + Sync {
    /// Returns the live session for `sender_id`, if any.
    fn get(&self, sender_id: &str) -> impl Future<Output = Option<Session>> + Send;

    /// Stores `session`, restarting its inactivity window.
    fn save(&self, session: Session) -> impl Future<Output = ()> + Send;

    /// Returns the live session, or a fresh one at `first` (not yet saved).
    ///
    /// The flag is `true` when the session was created.
    fn get_or_create(
        &self,
        sender_id: &str,
        first: Step,
    ) -> impl Future<Output = (Session, bool)> + Send {
        async move {
            match self.get(sender_id).await {
                Some(session) => (session, false),
                None => (Session::new(sender_id, first), true),
            }
        }
    }

    /// Replaces any session for `sender_id` with a fresh, saved one at `first`.
    fn reset(&self, sender_id: &str, first: Step) -> impl Future<Output = Session> + Send {
        async move {
            let session = Session::new(sender_id, first);
            self.save(session.clone()).await;
            session
        }
    }
}

/// Process-local [`SessionStore`].
#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: ExpiringMap<String, Session>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: ExpiringMap::new(ttl),
        }
    }

    pub(crate) fn get_at(&self, sender_id: &str, now: Instant) -> Option<Session> {
        self.sessions.sweep_at(now);
        self.sessions.get_at(sender_id, now)
    }

    pub(crate) fn save_at(&self, session: Session, now: Instant) {
        self.sessions
            .insert_at(session.sender_id.clone(), session, now);
    }

    /// Number of stored sessions, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    async fn get(&self, sender_id: &str) -> Option<Session> {
        self.get_at(sender_id, Instant::now())
    }

    async fn save(&self, session: Session) {
        self.save_at(session, Instant::now())
    }
}

/// One async mutex per sender.
#[derive(Debug, Default)]
pub struct SenderLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SenderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `sender_id`. Access ends when the
    /// returned guard is dropped.
    pub async fn lock(&self, sender_id: &str) -> OwnedMutexGuard<()> {
        self.prune();
        let lock = self
            .locks
            .entry(sender_id.to_owned())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drops locks nobody holds or waits on.
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of tracked senders.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
