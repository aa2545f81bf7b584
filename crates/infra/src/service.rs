//! Request-path orchestration: submission, processing under a time budget,
//! settlement, and the read operations clients poll.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use tryon_core::{
    DomainError, QuotaConfig, RetentionTier, TaskId, TaskStatus, TaskView, TryOnTask, UserId,
    entitlement, retention,
};

use crate::blob::DynBlobStore;
use crate::cache::{FiguresCache, UserFigures};
use crate::composition::DynComposer;
use crate::config::AppConfig;
use crate::fetch::RetryFetcher;
use crate::gateway::{SubmissionGateway, Submission, SubmitError};
use crate::ledger::UsageLedger;
use crate::store::{ChargeOutcome, DynRecordStore, StoreError};
use crate::worker::{ProcessingWorker, WorkerOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task {task_id} still processing after {attempts} checks")]
    PollTimedOut { task_id: TaskId, attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub quotas: QuotaConfig,
    pub max_upload_bytes: usize,
    /// How long `submit` waits for processing before answering `PROCESSING`.
    pub processing_budget: Duration,
    /// Oldest task a reconnecting client can recover.
    pub pending_window: chrono::Duration,
    /// A terminal task this recent is still reported as pending.
    pub recent_terminal_window: chrono::Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            quotas: QuotaConfig::default(),
            max_upload_bytes: 1024 * 1024,
            processing_budget: Duration::from_secs(55),
            pending_window: chrono::Duration::minutes(30),
            recent_terminal_window: chrono::Duration::minutes(5),
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            quotas: config.quotas,
            max_upload_bytes: config.request.max_upload_bytes,
            processing_budget: config.request.processing_budget,
            ..Self::default()
        }
    }
}

/// Client poll loop: fixed interval, bounded number of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(3),
        }
    }
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    pub message: String,
}

impl SubmitReceipt {
    fn for_task(task: &TryOnTask) -> Self {
        let message = match task.status {
            TaskStatus::Completed => "Try-on completed.".to_string(),
            TaskStatus::Failed => task
                .error_message
                .clone()
                .unwrap_or_else(|| crate::worker::GENERIC_FAILURE.to_string()),
            TaskStatus::Processing => "Still processing. Check back shortly for the result.".to_string(),
        };
        Self {
            task_id: task.id,
            status: task.status,
            result_url: task.result_url.clone(),
            message,
        }
    }
}

/// Worker then ledger, for one task.
#[derive(Clone)]
struct TaskPipeline {
    worker: ProcessingWorker,
    ledger: UsageLedger,
}

impl TaskPipeline {
    async fn run(&self, task: TryOnTask) -> WorkerOutcome {
        let outcome = self.worker.process(&task).await;
        if matches!(outcome, WorkerOutcome::Unrecorded { .. }) {
            return outcome;
        }
        if let Err(e) = self.ledger.settle(&task).await {
            error!(task_id = %task.id, error = %e, "usage settlement failed");
        }
        outcome
    }
}

#[derive(Clone)]
pub struct TryOnService {
    records: DynRecordStore,
    cache: Arc<FiguresCache>,
    gateway: SubmissionGateway,
    pipeline: TaskPipeline,
    settings: ServiceSettings,
}

impl TryOnService {
    pub fn new(
        records: DynRecordStore,
        blobs: DynBlobStore,
        fetcher: RetryFetcher,
        composer: DynComposer,
        cache: Arc<FiguresCache>,
        settings: ServiceSettings,
    ) -> Self {
        let gateway = SubmissionGateway::new(
            records.clone(),
            blobs.clone(),
            settings.quotas,
            settings.max_upload_bytes,
        );
        let pipeline = TaskPipeline {
            worker: ProcessingWorker::new(records.clone(), blobs, fetcher, composer),
            ledger: UsageLedger::new(records.clone(), cache.clone()),
        };
        Self {
            records,
            cache,
            gateway,
            pipeline,
            settings,
        }
    }

    pub fn records(&self) -> &DynRecordStore {
        &self.records
    }

    /// Accept a submission and process it within the configured budget.
    ///
    /// Processing runs on its own task. If the budget elapses first the
    /// receipt reports `PROCESSING` and the work carries on in the background.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitReceipt, ServiceError> {
        let task = self.gateway.submit(submission, Utc::now()).await?;
        self.cache.invalidate_user(task.user_id);

        let pipeline = self.pipeline.clone();
        let handle = tokio::spawn({
            let task = task.clone();
            async move { pipeline.run(task).await }
        });

        match tokio::time::timeout(self.settings.processing_budget, handle).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(task_id = %task.id, error = %e, "processing task aborted"),
            Err(_) => info!(
                task_id = %task.id,
                budget_ms = self.settings.processing_budget.as_millis() as u64,
                "processing budget elapsed; answering PROCESSING"
            ),
        }

        match self.records.get_task(task.id).await {
            Ok(Some(current)) => Ok(SubmitReceipt::for_task(&current)),
            Ok(None) => Ok(SubmitReceipt::for_task(&task)),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "could not reload task after processing");
                Ok(SubmitReceipt::for_task(&task))
            }
        }
    }

    /// Current state of one of `user`'s tasks. Other users' tasks are not found.
    pub async fn poll(&self, user: UserId, task_id: TaskId) -> Result<TaskView, ServiceError> {
        let task = self
            .records
            .get_task(task_id)
            .await?
            .filter(|t| t.user_id == user)
            .ok_or_else(DomainError::not_found)?;
        Ok(task.view())
    }

    /// Tasks a reconnecting client should keep watching: everything still
    /// processing, plus the latest terminal task if it is very recent.
    pub async fn pending_tasks(&self, user: UserId, now: DateTime<Utc>) -> Result<Vec<TaskView>, ServiceError> {
        let recent = self.records.recent_tasks(user, now - self.settings.pending_window).await?;
        let terminal_cutoff = now - self.settings.recent_terminal_window;

        let mut views: Vec<TaskView> = recent
            .iter()
            .filter(|t| t.status == TaskStatus::Processing)
            .map(TryOnTask::view)
            .collect();
        if let Some(latest) = recent
            .iter()
            .find(|t| t.status.is_terminal())
            .filter(|t| t.created_at >= terminal_cutoff)
        {
            views.push(latest.view());
        }
        Ok(views)
    }

    /// Cached balance and usage figures.
    pub async fn balance(&self, user: UserId, now: DateTime<Utc>) -> Result<UserFigures, ServiceError> {
        let records = self.records.clone();
        let quotas = self.settings.quotas;
        let figures = self
            .cache
            .get_or_compute(user, || async move {
                let account = records.ensure_user(user).await?;
                let counts = records.task_counts(user).await?;
                let entitlement = entitlement::resolve(&account, &quotas, now);
                Ok::<_, StoreError>(UserFigures {
                    tier: entitlement.tier,
                    remaining: entitlement.remaining,
                    credits_balance: account.credits_balance(),
                    plan_display_name: retention::plan_display_name(&account, now).to_string(),
                    retention_days: RetentionTier::for_account(&account, now).days(),
                    total_tasks: counts.total,
                    completed_tasks: counts.completed,
                })
            })
            .await?;
        Ok(figures)
    }

    /// Poll until the task is terminal or the policy runs out of attempts.
    pub async fn await_terminal(
        &self,
        user: UserId,
        task_id: TaskId,
        policy: PollPolicy,
    ) -> Result<TaskView, ServiceError> {
        for attempt in 1..=policy.attempts {
            let view = self.poll(user, task_id).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Err(ServiceError::PollTimedOut {
            task_id,
            attempts: policy.attempts,
        })
    }

    /// Re-drive a task left in `PROCESSING`, e.g. after a restart.
    pub async fn resume(&self, task: TryOnTask) -> WorkerOutcome {
        self.pipeline.run(task).await
    }

    /// Charge a completed task whose settlement never went through.
    pub async fn settle(&self, task: &TryOnTask) -> Result<ChargeOutcome, StoreError> {
        self.pipeline.ledger.settle(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tryon_core::{SubscriptionPlan, UserAccount};

    use crate::composition::{CompositionError, CompositionOutput};
    use crate::gateway::Upload;
    use crate::store::RecordStore;
    use crate::testing::{Harness, PNG_BYTES};

    fn submission(user: UserId) -> Submission {
        Submission {
            user,
            subject: Some(Upload::new(PNG_BYTES.to_vec())),
            item: Some(Upload::new(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3])),
            category: tryon_core::ItemCategory::Glasses,
        }
    }

    async fn seed(h: &Harness, account: &UserAccount) {
        h.records.upsert_user(account).await.unwrap();
    }

    async fn user(h: &Harness, id: UserId) -> UserAccount {
        h.records.get_user(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn fetch_recovers_on_third_attempt() {
        let h = Harness::new();
        let id = UserId::new();
        h.blobs.fail_next_fetches(2);

        let receipt = h.service.submit(submission(id)).await.unwrap();

        assert_eq!(receipt.status, TaskStatus::Completed);
        assert!(receipt.result_url.is_some());
        assert_eq!(user(&h, id).await.free_trials_used, 1);
    }

    #[tokio::test]
    async fn refusal_fails_the_task_without_charging() {
        let h = Harness::new();
        let id = UserId::new();
        h.composer
            .push(Ok(CompositionOutput::Refusal("No person found in the photo.".into())));

        let receipt = h.service.submit(submission(id)).await.unwrap();

        assert_eq!(receipt.status, TaskStatus::Failed);
        assert_eq!(receipt.message, "No person found in the photo.");
        let view = h.service.poll(id, receipt.task_id).await.unwrap();
        assert_eq!(view.error.as_deref(), Some("No person found in the photo."));
        assert_eq!(user(&h, id).await.free_trials_used, 0);
    }

    #[tokio::test]
    async fn transport_errors_record_the_generic_message() {
        let h = Harness::new();
        let id = UserId::new();
        h.composer.push(Err(CompositionError::Transport("connection reset".into())));

        let receipt = h.service.submit(submission(id)).await.unwrap();

        assert_eq!(receipt.status, TaskStatus::Failed);
        assert_eq!(receipt.message, crate::worker::GENERIC_FAILURE);
    }

    #[tokio::test]
    async fn budget_overrun_answers_processing_then_completes() {
        let h = Harness::with_settings(ServiceSettings {
            processing_budget: Duration::from_millis(20),
            ..ServiceSettings::default()
        });
        let id = UserId::new();
        h.composer.set_delay(Duration::from_millis(200));

        let receipt = h.service.submit(submission(id)).await.unwrap();
        assert_eq!(receipt.status, TaskStatus::Processing);
        assert_eq!(receipt.result_url, None);

        let pending = h.service.pending_tasks(id, Utc::now()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, receipt.task_id);

        let view = h
            .service
            .await_terminal(
                id,
                receipt.task_id,
                PollPolicy {
                    attempts: 50,
                    interval: Duration::from_millis(20),
                },
            )
            .await
            .unwrap();
        assert_eq!(view.status, TaskStatus::Completed);

        // Settlement follows the terminal write on the same spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(user(&h, id).await.free_trials_used, 1);
    }

    #[tokio::test]
    async fn poll_loop_gives_up_after_its_attempts() {
        let h = Harness::with_settings(ServiceSettings {
            processing_budget: Duration::from_millis(10),
            ..ServiceSettings::default()
        });
        let id = UserId::new();
        h.composer.set_delay(Duration::from_secs(5));

        let receipt = h.service.submit(submission(id)).await.unwrap();
        let err = h
            .service
            .await_terminal(
                id,
                receipt.task_id,
                PollPolicy {
                    attempts: 3,
                    interval: Duration::from_millis(5),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::PollTimedOut { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn premium_consumes_subscription_before_credits() {
        let h = Harness::new();
        let mut account = UserAccount::new(UserId::new());
        account.activate_subscription(SubscriptionPlan::Monthly, None);
        account.premium_usage_count = 89;
        account.credits_purchased = 5;
        seed(&h, &account).await;

        for _ in 0..2 {
            let receipt = h.service.submit(submission(account.id)).await.unwrap();
            assert_eq!(receipt.status, TaskStatus::Completed);
        }

        let after = user(&h, account.id).await;
        assert_eq!(after.premium_usage_count, 90);
        assert_eq!(after.credits_balance(), 4);
    }

    #[tokio::test]
    async fn free_user_consumes_credits_before_trial() {
        let h = Harness::new();
        let mut account = UserAccount::new(UserId::new());
        account.credits_purchased = 2;
        seed(&h, &account).await;

        for _ in 0..2 {
            h.service.submit(submission(account.id)).await.unwrap();
        }
        let after = user(&h, account.id).await;
        assert_eq!(after.credits_balance(), 0);
        assert_eq!(after.free_trials_used, 0);

        h.service.submit(submission(account.id)).await.unwrap();
        assert_eq!(user(&h, account.id).await.free_trials_used, 1);

        let err = h.service.submit(submission(account.id)).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Submit(SubmitError::Domain(DomainError::QuotaExhausted(_)))
        ));
    }

    #[tokio::test]
    async fn identical_uploads_still_complete() {
        let h = Harness::new();
        let id = UserId::new();
        let mut same = submission(id);
        same.item = same.subject.clone();

        let receipt = h.service.submit(same).await.unwrap();

        assert_eq!(receipt.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn other_users_tasks_are_not_found() {
        let h = Harness::new();
        let owner = UserId::new();
        let receipt = h.service.submit(submission(owner)).await.unwrap();

        let err = h.service.poll(UserId::new(), receipt.task_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Domain(DomainError::NotFound)));
    }

    #[tokio::test]
    async fn balance_is_recomputed_after_settlement() {
        let h = Harness::new();
        let id = UserId::new();

        let before = h.service.balance(id, Utc::now()).await.unwrap();
        assert_eq!(before.remaining, 1);
        assert_eq!(before.plan_display_name, "Free");

        h.service.submit(submission(id)).await.unwrap();

        let after = h.service.balance(id, Utc::now()).await.unwrap();
        assert_eq!(after.remaining, 0);
        assert_eq!(after.total_tasks, 1);
        assert_eq!(after.completed_tasks, 1);
    }

    #[tokio::test]
    async fn pending_includes_only_the_latest_recent_terminal_task() {
        let h = Harness::new();
        let id = UserId::new();
        let mut account = UserAccount::new(id);
        account.credits_purchased = 2;
        seed(&h, &account).await;

        let first = h.service.submit(submission(id)).await.unwrap();
        let second = h.service.submit(submission(id)).await.unwrap();

        let pending = h.service.pending_tasks(id, Utc::now()).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|v| v.task_id).collect();
        assert_eq!(ids, vec![second.task_id]);
        assert_ne!(first.task_id, second.task_id);

        let later = Utc::now() + chrono::Duration::minutes(10);
        assert!(h.service.pending_tasks(id, later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resuming_a_settled_task_changes_nothing() {
        let h = Harness::new();
        let id = UserId::new();
        let receipt = h.service.submit(submission(id)).await.unwrap();
        let task = h.records.get_task(receipt.task_id).await.unwrap().unwrap();

        assert_eq!(h.service.resume(task).await, WorkerOutcome::AlreadyTerminal);
        assert_eq!(user(&h, id).await.free_trials_used, 1);
        assert_eq!(h.composer.calls(), 1);
    }
}
