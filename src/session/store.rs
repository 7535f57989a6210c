//! In-memory session table keyed by API key.
//!
//! Each key owns a slot guarded by its own async mutex. Holding the slot
//! lock across discovery and creation serialises first use of a key, so two
//! concurrent requests with the same key share one backend session. Different
//! keys never contend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::config::{ManualSession, SessionToken};

/// Where a session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Created by this process through the login call; owned and torn down here.
    Created,
    /// Supplied by the operator; never expired or logged out here.
    Manual,
}

/// Backend-issued credentials for one session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub session_id: String,
    pub token: SessionToken,
    pub created_at: DateTime<Utc>,
    pub origin: SessionOrigin,
    issued: Instant,
}

impl Session {
    pub fn created(user_id: String, session_id: String, token: SessionToken) -> Self {
        Self {
            user_id,
            session_id,
            token,
            created_at: Utc::now(),
            origin: SessionOrigin::Created,
            issued: Instant::now(),
        }
    }

    pub fn manual(manual: &ManualSession) -> Self {
        Self {
            user_id: manual.user_id.clone(),
            session_id: manual.session_id.clone(),
            token: manual.token.clone().unwrap_or_else(|| SessionToken::from("")),
            created_at: Utc::now(),
            origin: SessionOrigin::Manual,
            issued: Instant::now(),
        }
    }

    pub fn is_manual(&self) -> bool {
        self.origin == SessionOrigin::Manual
    }

    /// Monotonic time since the session was issued.
    pub fn age(&self) -> Duration {
        self.issued.elapsed()
    }
}

type Slot = Arc<Mutex<Option<Session>>>;

/// Exclusive access to one key's entry.
pub type SlotGuard = OwnedMutexGuard<Option<Session>>;

/// Session table with per-key locking and a freshness window.
pub struct SessionStore {
    slots: DashMap<String, Slot>,
    freshness: Duration,
}

impl SessionStore {
    pub fn new(freshness: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            freshness,
        }
    }

    /// Whether a session is young enough to be reused.
    pub fn is_fresh(&self, session: &Session) -> bool {
        session.age() < self.freshness
    }

    /// Lock the slot for `key`, creating an empty one if needed.
    pub async fn lock(&self, key: &str) -> SlotGuard {
        // Clone the Arc out so no map shard lock is held across the await.
        let slot = self.slots.entry(key.to_string()).or_default().value().clone();
        slot.lock_owned().await
    }

    /// The cached session for `key` if it is still fresh.
    pub async fn get_fresh(&self, key: &str) -> Option<Session> {
        let slot = self.slots.get(key).map(|entry| entry.value().clone())?;
        let guard = slot.lock().await;
        guard.as_ref().filter(|s| self.is_fresh(s)).cloned()
    }

    /// Remove and return the session cached for `key`, fresh or not.
    pub async fn take(&self, key: &str) -> Option<Session> {
        let session = {
            let slot = self.slots.get(key).map(|entry| entry.value().clone())?;
            let mut guard = slot.lock().await;
            guard.take()
        };
        self.release_if_idle(key);
        session
    }

    /// Drop the slot for `key` if it is empty and nobody else holds it.
    ///
    /// The guard for `key` must be released before calling this.
    pub fn release_if_idle(&self, key: &str) {
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|guard| guard.is_none()).unwrap_or(false)
        });
    }

    /// Keys that currently have a slot.
    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of keys holding a session.
    pub async fn occupied(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}
