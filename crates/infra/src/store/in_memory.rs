use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tryon_core::{TaskId, TaskStatus, TryOnTask, UserAccount, UserId, entitlement};

use super::{ChargeOutcome, RecordStore, StoreError, TaskCounts};

#[derive(Debug, Default)]
struct State {
    users: HashMap<UserId, UserAccount>,
    tasks: HashMap<TaskId, TryOnTask>,
}

/// In-memory record store for tests/dev.
///
/// Accounts and tasks sit behind one lock so the settle-and-charge step is as
/// atomic here as the transactional Postgres implementation.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: RwLock<State>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("record store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("record store lock poisoned".to_string()))
    }

    fn transition(
        &self,
        id: TaskId,
        at: DateTime<Utc>,
        apply: impl FnOnce(&mut TryOnTask),
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if task.status != TaskStatus::Processing {
            return Ok(false);
        }
        apply(task);
        task.updated_at = at;
        Ok(true)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_user(&self, id: UserId) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    async fn ensure_user(&self, id: UserId) -> Result<UserAccount, StoreError> {
        let mut state = self.write()?;
        Ok(state
            .users
            .entry(id)
            .or_insert_with(|| UserAccount::new(id))
            .clone())
    }

    async fn upsert_user(&self, account: &UserAccount) -> Result<(), StoreError> {
        account
            .check_invariants()
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let mut state = self.write()?;
        let mut next = account.clone();
        // Counters never move backwards, even if the caller holds a stale copy.
        if let Some(existing) = state.users.get(&account.id) {
            next.free_trials_used = next.free_trials_used.max(existing.free_trials_used);
            next.premium_usage_count = next.premium_usage_count.max(existing.premium_usage_count);
            next.credits_purchased = next.credits_purchased.max(existing.credits_purchased);
            next.credits_used = next.credits_used.max(existing.credits_used);
        }
        state.users.insert(account.id, next);
        Ok(())
    }

    async fn insert_task(&self, task: &TryOnTask) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.users.contains_key(&task.user_id) {
            return Err(StoreError::UserNotFound(task.user_id));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TryOnTask>, StoreError> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn complete_task(
        &self,
        id: TaskId,
        result_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.transition(id, at, |task| {
            task.status = TaskStatus::Completed;
            task.result_url = Some(result_url.to_string());
            task.error_message = None;
        })
    }

    async fn fail_task(&self, id: TaskId, message: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition(id, at, |task| {
            task.status = TaskStatus::Failed;
            task.error_message = Some(message.to_string());
        })
    }

    async fn charge_usage(&self, id: TaskId) -> Result<ChargeOutcome, StoreError> {
        let mut guard = self.write()?;
        let state = &mut *guard;

        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if task.status != TaskStatus::Completed {
            return Ok(ChargeOutcome::NotCompleted);
        }
        if task.usage_charged {
            return Ok(ChargeOutcome::AlreadyCharged);
        }

        let account = state
            .users
            .get_mut(&task.user_id)
            .ok_or(StoreError::UserNotFound(task.user_id))?;

        task.usage_charged = true;
        Ok(
            match entitlement::charge_first_available(&task.charge_plan, account) {
                Some(sub_tier) => ChargeOutcome::Charged(sub_tier),
                None => ChargeOutcome::NoAllowance,
            },
        )
    }

    async fn recent_tasks(&self, user: UserId, since: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError> {
        let state = self.read()?;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.user_id == user && t.created_at >= since)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(tasks)
    }

    async fn task_counts(&self, user: UserId) -> Result<TaskCounts, StoreError> {
        let state = self.read()?;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.user_id == user)
            .fold(TaskCounts::default(), |mut acc, t| {
                acc.total += 1;
                if t.status == TaskStatus::Completed {
                    acc.completed += 1;
                }
                acc
            }))
    }

    async fn stale_processing_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError> {
        let state = self.read()?;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing && t.created_at < cutoff)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn unsettled_completed_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError> {
        let state = self.read()?;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed && !t.usage_charged && t.updated_at < cutoff)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.updated_at);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn tasks_missing_expiry(
        &self,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError> {
        let state = self.read()?;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.expires_at.is_none() && after.is_none_or(|a| t.id > a))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn set_expiry_if_absent(&self, id: TaskId, expires_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if task.expires_at.is_some() {
            return Ok(false);
        }
        task.expires_at = Some(expires_at);
        Ok(true)
    }

    async fn expired_terminal_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError> {
        let state = self.read()?;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.expires_at.is_some_and(|at| at < now))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        Ok(ids.iter().filter(|id| state.tasks.remove(*id).is_some()).count() as u64)
    }

    async fn referenced_urls(&self) -> Result<HashSet<String>, StoreError> {
        let state = self.read()?;
        let mut urls: HashSet<String> = state
            .tasks
            .values()
            .flat_map(|t| t.payload_urls().map(str::to_string).collect::<Vec<_>>())
            .collect();
        urls.extend(state.users.values().filter_map(|u| u.image.clone()));
        Ok(urls)
    }
}
