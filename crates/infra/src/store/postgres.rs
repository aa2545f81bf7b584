//! Postgres-backed record store.
//!
//! ## Atomic Counters
//!
//! Usage is never computed in application code and written back. Each
//! deduction is one statement of the form
//! `UPDATE ... SET c = c + 1 WHERE id = $1 AND c < limit`, so two concurrent
//! settlements can never lose an update or push a balance below zero. The
//! settlement claim (`usage_charged`) and the increment share a transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / other | N/A | `Storage` |
//!
//! ## Thread Safety
//!
//! `PostgresRecordStore` is `Send + Sync` and can be shared across threads.
//! All operations use the SQLx connection pool.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use tryon_core::{
    ChargeStep, ItemCategory, SubTier, SubscriptionPlan, TaskId, TaskStatus, TryOnTask, UserAccount,
    UserId,
};

use super::{ChargeOutcome, RecordStore, StoreError, TaskCounts};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tryon_users (
        id UUID PRIMARY KEY,
        is_premium BOOLEAN NOT NULL DEFAULT FALSE,
        premium_expires_at TIMESTAMPTZ,
        subscription_plan TEXT,
        free_trials_used BIGINT NOT NULL DEFAULT 0 CHECK (free_trials_used >= 0),
        premium_usage_count BIGINT NOT NULL DEFAULT 0 CHECK (premium_usage_count >= 0),
        credits_purchased BIGINT NOT NULL DEFAULT 0 CHECK (credits_purchased >= 0),
        credits_used BIGINT NOT NULL DEFAULT 0 CHECK (credits_used >= 0),
        image TEXT,
        CONSTRAINT credits_within_purchase CHECK (credits_used <= credits_purchased)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tryon_tasks (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES tryon_users (id) ON DELETE CASCADE,
        category TEXT NOT NULL,
        subject_url TEXT NOT NULL,
        item_url TEXT NOT NULL,
        result_url TEXT,
        status TEXT NOT NULL CHECK (status IN ('PROCESSING', 'COMPLETED', 'FAILED')),
        error_message TEXT,
        charge_plan JSONB NOT NULL DEFAULT '[]'::jsonb,
        usage_charged BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS tryon_tasks_user_created_idx ON tryon_tasks (user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS tryon_tasks_expires_idx ON tryon_tasks (expires_at) WHERE expires_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS tryon_tasks_processing_idx ON tryon_tasks (created_at) WHERE status = 'PROCESSING'",
];

const TASK_COLUMNS: &str = "id, user_id, category, subject_url, item_url, result_url, status, \
     error_message, charge_plan, usage_charged, created_at, updated_at, expires_at";

const USER_COLUMNS: &str = "id, is_premium, premium_expires_at, subscription_plan, free_trials_used, \
     premium_usage_count, credits_purchased, credits_used, image";

#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn load_user(&self, id: UserId) -> Result<Option<UserAccount>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM tryon_users WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_user", e))?;
        row.map(|r| user_from_row(&r)).transpose()
    }

    async fn select_tasks(&self, operation: &str, sql: String, binds: TaskBinds) -> Result<Vec<TryOnTask>, StoreError> {
        let mut query = sqlx::query(&sql);
        query = match binds {
            TaskBinds::Time(at) => query.bind(at),
            TaskBinds::UserSince(user, since) => query.bind(user).bind(since),
            TaskBinds::TimeLimit(at, limit) => query.bind(at).bind(limit),
            TaskBinds::AfterLimit(after, limit) => query.bind(after).bind(limit),
        };
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(task_from_row).collect()
    }
}

enum TaskBinds {
    Time(DateTime<Utc>),
    UserSince(Uuid, DateTime<Utc>),
    TimeLimit(DateTime<Utc>, i64),
    AfterLimit(Option<Uuid>, i64),
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn get_user(&self, id: UserId) -> Result<Option<UserAccount>, StoreError> {
        self.load_user(id).await
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn ensure_user(&self, id: UserId) -> Result<UserAccount, StoreError> {
        sqlx::query("INSERT INTO tryon_users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_user", e))?;
        self.load_user(id).await?.ok_or(StoreError::UserNotFound(id))
    }

    #[instrument(skip(self, account), fields(user_id = %account.id), err)]
    async fn upsert_user(&self, account: &UserAccount) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tryon_users (
                id, is_premium, premium_expires_at, subscription_plan, free_trials_used,
                premium_usage_count, credits_purchased, credits_used, image
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                is_premium = EXCLUDED.is_premium,
                premium_expires_at = EXCLUDED.premium_expires_at,
                subscription_plan = EXCLUDED.subscription_plan,
                free_trials_used = GREATEST(tryon_users.free_trials_used, EXCLUDED.free_trials_used),
                premium_usage_count = GREATEST(tryon_users.premium_usage_count, EXCLUDED.premium_usage_count),
                credits_purchased = GREATEST(tryon_users.credits_purchased, EXCLUDED.credits_purchased),
                credits_used = GREATEST(tryon_users.credits_used, EXCLUDED.credits_used),
                image = EXCLUDED.image
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.is_premium)
        .bind(account.premium_expires_at)
        .bind(account.subscription_plan.map(|p| p.as_str()))
        .bind(account.free_trials_used)
        .bind(account.premium_usage_count)
        .bind(account.credits_purchased)
        .bind(account.credits_used)
        .bind(account.image.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_user", e))?;
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, user_id = %task.user_id), err)]
    async fn insert_task(&self, task: &TryOnTask) -> Result<(), StoreError> {
        let plan = serde_json::to_value(&task.charge_plan)
            .map_err(|e| StoreError::Corrupt(format!("charge_plan: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO tryon_tasks (
                id, user_id, category, subject_url, item_url, result_url, status,
                error_message, charge_plan, usage_charged, created_at, updated_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(task.user_id.as_uuid())
        .bind(task.category.as_str())
        .bind(&task.subject_url)
        .bind(&task.item_url)
        .bind(task.result_url.as_deref())
        .bind(task.status.as_str())
        .bind(task.error_message.as_deref())
        .bind(plan)
        .bind(task.usage_charged)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get_task(&self, id: TaskId) -> Result<Option<TryOnTask>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tryon_tasks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self, result_url), fields(task_id = %id), err)]
    async fn complete_task(
        &self,
        id: TaskId,
        result_url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tryon_tasks
            SET status = 'COMPLETED', result_url = $2, error_message = NULL, updated_at = $3
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(result_url)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_task", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, message), fields(task_id = %id), err)]
    async fn fail_task(&self, id: TaskId, message: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tryon_tasks
            SET status = 'FAILED', error_message = $2, updated_at = $3
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id.as_uuid())
        .bind(message)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_task", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn charge_usage(&self, id: TaskId) -> Result<ChargeOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let claimed = sqlx::query(
            r#"
            UPDATE tryon_tasks
            SET usage_charged = TRUE
            WHERE id = $1 AND status = 'COMPLETED' AND usage_charged = FALSE
            RETURNING user_id, charge_plan
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_settlement", e))?;

        let Some(row) = claimed else {
            let outcome = unclaimed_outcome(&mut tx, id).await;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return outcome;
        };

        let user_id: Uuid = row
            .try_get("user_id")
            .map_err(|e| StoreError::Corrupt(format!("user_id: {e}")))?;
        let plan_json: serde_json::Value = row
            .try_get("charge_plan")
            .map_err(|e| StoreError::Corrupt(format!("charge_plan: {e}")))?;
        let plan: Vec<ChargeStep> = serde_json::from_value(plan_json)
            .map_err(|e| StoreError::Corrupt(format!("charge_plan: {e}")))?;

        for step in &plan {
            if guarded_increment(&mut tx, user_id, step).await? {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                debug!(sub_tier = step.sub_tier.as_str(), "usage charged");
                return Ok(ChargeOutcome::Charged(step.sub_tier));
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        warn!("no sub-tier could absorb the charge");
        Ok(ChargeOutcome::NoAllowance)
    }

    #[instrument(skip(self), fields(user_id = %user), err)]
    async fn recent_tasks(&self, user: UserId, since: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError> {
        self.select_tasks(
            "recent_tasks",
            format!(
                "SELECT {TASK_COLUMNS} FROM tryon_tasks \
                 WHERE user_id = $1 AND created_at >= $2 ORDER BY created_at DESC, id DESC"
            ),
            TaskBinds::UserSince(*user.as_uuid(), since),
        )
        .await
    }

    #[instrument(skip(self), fields(user_id = %user), err)]
    async fn task_counts(&self, user: UserId) -> Result<TaskCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed
            FROM tryon_tasks
            WHERE user_id = $1
            "#,
        )
        .bind(user.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("task_counts", e))?;

        Ok(TaskCounts {
            total: row.try_get("total").map_err(|e| StoreError::Corrupt(e.to_string()))?,
            completed: row.try_get("completed").map_err(|e| StoreError::Corrupt(e.to_string()))?,
        })
    }

    #[instrument(skip(self), err)]
    async fn stale_processing_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError> {
        self.select_tasks(
            "stale_processing_tasks",
            format!(
                "SELECT {TASK_COLUMNS} FROM tryon_tasks \
                 WHERE status = 'PROCESSING' AND created_at < $1 ORDER BY created_at ASC LIMIT $2"
            ),
            TaskBinds::TimeLimit(cutoff, limit as i64),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn unsettled_completed_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError> {
        self.select_tasks(
            "unsettled_completed_tasks",
            format!(
                "SELECT {TASK_COLUMNS} FROM tryon_tasks \
                 WHERE status = 'COMPLETED' AND usage_charged = FALSE AND updated_at < $1 \
                 ORDER BY updated_at ASC LIMIT $2"
            ),
            TaskBinds::TimeLimit(cutoff, limit as i64),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn tasks_missing_expiry(
        &self,
        after: Option<TaskId>,
        limit: usize,
    ) -> Result<Vec<TryOnTask>, StoreError> {
        self.select_tasks(
            "tasks_missing_expiry",
            format!(
                "SELECT {TASK_COLUMNS} FROM tryon_tasks \
                 WHERE expires_at IS NULL AND ($1::uuid IS NULL OR id > $1) ORDER BY id ASC LIMIT $2"
            ),
            TaskBinds::AfterLimit(after.map(Uuid::from), limit as i64),
        )
        .await
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn set_expiry_if_absent(&self, id: TaskId, expires_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE tryon_tasks SET expires_at = $2 WHERE id = $1 AND expires_at IS NULL")
            .bind(id.as_uuid())
            .bind(expires_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_expiry_if_absent", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn expired_terminal_tasks(&self, now: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError> {
        self.select_tasks(
            "expired_terminal_tasks",
            format!(
                "SELECT {TASK_COLUMNS} FROM tryon_tasks \
                 WHERE expires_at < $1 AND status IN ('COMPLETED', 'FAILED') ORDER BY created_at ASC"
            ),
            TaskBinds::Time(now),
        )
        .await
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn delete_tasks(&self, ids: &[TaskId]) -> Result<u64, StoreError> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query("DELETE FROM tryon_tasks WHERE id = ANY($1)")
            .bind(&uuids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_tasks", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn referenced_urls(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT subject_url AS url FROM tryon_tasks
            UNION SELECT item_url FROM tryon_tasks
            UNION SELECT result_url FROM tryon_tasks WHERE result_url IS NOT NULL
            UNION SELECT image FROM tryon_users WHERE image IS NOT NULL
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("referenced_urls", e))?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("url").map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }
}

/// Apply one guarded increment. Returns whether the guard held.
async fn guarded_increment(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    step: &ChargeStep,
) -> Result<bool, StoreError> {
    let query = match step.sub_tier {
        SubTier::Subscription => sqlx::query(
            "UPDATE tryon_users SET premium_usage_count = premium_usage_count + 1 \
             WHERE id = $1 AND premium_usage_count < $2",
        )
        .bind(user_id)
        .bind(step.limit.unwrap_or(0)),
        SubTier::FreeTrial => sqlx::query(
            "UPDATE tryon_users SET free_trials_used = free_trials_used + 1 \
             WHERE id = $1 AND free_trials_used < $2",
        )
        .bind(user_id)
        .bind(step.limit.unwrap_or(0)),
        SubTier::Credits => sqlx::query(
            "UPDATE tryon_users SET credits_used = credits_used + 1 \
             WHERE id = $1 AND credits_used < credits_purchased",
        )
        .bind(user_id),
    };

    let result = query
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("guarded_increment", e))?;
    Ok(result.rows_affected() == 1)
}

/// Explain why a settlement claim matched no row.
///
/// A concurrent claim holds the row lock until it commits, so by the time the
/// claim above returns, a completed task has already been settled.
async fn unclaimed_outcome(
    tx: &mut Transaction<'_, Postgres>,
    id: TaskId,
) -> Result<ChargeOutcome, StoreError> {
    let row = sqlx::query("SELECT status FROM tryon_tasks WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("inspect_settlement", e))?
        .ok_or(StoreError::TaskNotFound(id))?;

    let status: String = row.try_get("status").map_err(|e| StoreError::Corrupt(e.to_string()))?;

    Ok(if status == TaskStatus::Completed.as_str() {
        ChargeOutcome::AlreadyCharged
    } else {
        ChargeOutcome::NotCompleted
    })
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> Result<UserAccount, StoreError> {
    let corrupt = |e: sqlx::Error| StoreError::Corrupt(format!("tryon_users: {e}"));
    let plan: Option<String> = row.try_get("subscription_plan").map_err(corrupt)?;
    let id: Uuid = row.try_get("id").map_err(corrupt)?;

    Ok(UserAccount {
        id: UserId::from_uuid(id),
        is_premium: row.try_get("is_premium").map_err(corrupt)?,
        premium_expires_at: row.try_get("premium_expires_at").map_err(corrupt)?,
        subscription_plan: plan
            .as_deref()
            .map(SubscriptionPlan::parse)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        free_trials_used: row.try_get("free_trials_used").map_err(corrupt)?,
        premium_usage_count: row.try_get("premium_usage_count").map_err(corrupt)?,
        credits_purchased: row.try_get("credits_purchased").map_err(corrupt)?,
        credits_used: row.try_get("credits_used").map_err(corrupt)?,
        image: row.try_get("image").map_err(corrupt)?,
    })
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<TryOnTask, StoreError> {
    let corrupt = |e: sqlx::Error| StoreError::Corrupt(format!("tryon_tasks: {e}"));
    let domain = |e: tryon_core::DomainError| StoreError::Corrupt(e.to_string());

    let id: Uuid = row.try_get("id").map_err(corrupt)?;
    let user_id: Uuid = row.try_get("user_id").map_err(corrupt)?;
    let category: String = row.try_get("category").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let plan: serde_json::Value = row.try_get("charge_plan").map_err(corrupt)?;

    Ok(TryOnTask {
        id: TaskId::from_uuid(id),
        user_id: UserId::from_uuid(user_id),
        category: category.parse::<ItemCategory>().map_err(domain)?,
        subject_url: row.try_get("subject_url").map_err(corrupt)?,
        item_url: row.try_get("item_url").map_err(corrupt)?,
        result_url: row.try_get("result_url").map_err(corrupt)?,
        status: status.parse::<TaskStatus>().map_err(domain)?,
        error_message: row.try_get("error_message").map_err(corrupt)?,
        charge_plan: serde_json::from_value(plan)
            .map_err(|e| StoreError::Corrupt(format!("charge_plan: {e}")))?,
        usage_charged: row.try_get("usage_charged").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        expires_at: row.try_get("expires_at").map_err(corrupt)?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // unique, foreign key and check constraint violations
                Some("23505") | Some("23503") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
