//! Record store: accounts and try-on tasks.
//!
//! Every status transition is a check-and-set against `PROCESSING`, and every
//! usage deduction is a single guarded increment. Implementations must keep
//! those writes atomic; callers never read-modify-write counters themselves.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tryon_core::{SubTier, TaskId, TryOnTask, UserAccount, UserId};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRecordStore;
pub use postgres::PostgresRecordStore;

/// Shared handle used by services and jobs.
pub type DynRecordStore = Arc<dyn RecordStore>;

/// Result of settling usage for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// One unit was taken from this sub-tier.
    Charged(SubTier),
    /// Usage for this task was settled earlier.
    AlreadyCharged,
    /// The task is not `COMPLETED`; nothing is owed.
    NotCompleted,
    /// Every guard in the stored plan failed. The task is marked settled anyway.
    NoAllowance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounts {
    pub total: i64,
    pub completed: i64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("user not found: {0}")]
    UserNotFound(UserId),
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> Result<Option<UserAccount>, StoreError>;

    /// Load an account, creating a fresh free-tier one on first sight.
    async fn ensure_user(&self, id: UserId) -> Result<UserAccount, StoreError>;

    /// Insert or replace tier fields and counters (payment effects, seeding).
    async fn upsert_user(&self, account: &UserAccount) -> Result<(), StoreError>;

    async fn insert_task(&self, task: &TryOnTask) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<TryOnTask>, StoreError>;

    /// `PROCESSING -> COMPLETED`. Returns `false` if the task was already terminal.
    async fn complete_task(
        &self,
        id: TaskId,
        result_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `PROCESSING -> FAILED`. Returns `false` if the task was already terminal.
    async fn fail_task(&self, id: TaskId, message: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Claim the task for settlement and apply the first guarded increment of
    /// its stored charge plan, atomically.
    async fn charge_usage(&self, id: TaskId) -> Result<ChargeOutcome, StoreError>;

    /// The user's tasks created at or after `since`, newest first.
    async fn recent_tasks(&self, user: UserId, since: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError>;

    async fn task_counts(&self, user: UserId) -> Result<TaskCounts, StoreError>;

    /// `PROCESSING` tasks created before `cutoff`, oldest first.
    async fn stale_processing_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError>;

    /// `COMPLETED` tasks whose usage was never settled, last touched before
    /// `cutoff`, oldest first.
    async fn unsettled_completed_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError>;

    /// Tasks without an expiry, ordered by id, strictly after `after`.
    async fn tasks_missing_expiry(
        &self,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError>;

    /// Set `expires_at` only if it is still unset. Returns whether a write happened.
    async fn set_expiry_if_absent(&self, id: TaskId, expires_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Terminal tasks whose `expires_at` is before `now`.
    async fn expired_terminal_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError>;

    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<u64, StoreError>;

    /// Every payload URL referenced by a task or a profile image.
    async fn referenced_urls(&self) -> Result<HashSet<String>, StoreError>;
}
