//! Per-user read cache for balance figures.
//!
//! Entries are never patched in place. A write that changes what a user would
//! see invalidates the user's entry, and the next read recomputes from the
//! record store. Writes made by another process (the maintenance jobs) are
//! only picked up once the TTL lapses.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use tryon_core::{Tier, UserId};

/// Balance and usage figures shown to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFigures {
    pub tier: Tier,
    pub remaining: i64,
    pub credits_balance: i64,
    pub plan_display_name: String,
    pub retention_days: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct ReadCache<V> {
    entries: RwLock<HashMap<UserId, Entry<V>>>,
    ttl: Duration,
}

pub type FiguresCache = ReadCache<UserFigures>;

impl<V: Clone> ReadCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, user: UserId) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&user)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    pub fn insert(&self, user: UserId, value: V) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            user,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Serve from cache or compute and remember.
    pub async fn get_or_compute<F, Fut, E>(&self, user: UserId, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(user) {
            return Ok(hit);
        }
        let value = compute().await?;
        self.insert(user, value.clone());
        Ok(value)
    }

    pub fn invalidate_user(&self, user: UserId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = entries.remove(&user).is_some();
        debug!(user_id = %user, dropped, "cache invalidated");
    }
}
