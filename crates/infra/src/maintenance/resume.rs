//! Re-drives tasks stuck in `PROCESSING`, e.g. after a crash mid-request,
//! and settles completed tasks whose charge never went through.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tryon_core::{TaskId, TryOnTask};

use crate::service::TryOnService;
use crate::store::{ChargeOutcome, StoreError};
use crate::worker::WorkerOutcome;

pub struct StaleTaskResumer {
    service: TryOnService,
    stale_after: chrono::Duration,
    limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub dry_run: bool,
    pub stale: usize,
    pub sample_task_ids: Vec<TaskId>,
    pub completed: usize,
    pub failed: usize,
    pub already_terminal: usize,
    pub unrecorded: usize,
    pub unsettled: usize,
    pub charged: usize,
    pub settle_errors: usize,
}

impl StaleTaskResumer {
    pub fn new(service: TryOnService, stale_after: chrono::Duration, limit: usize) -> Self {
        Self {
            service,
            stale_after,
            limit,
        }
    }

    /// Run each task created before `now - stale_after` that is still
    /// processing through the worker and ledger again, one at a time. Then
    /// settle completed tasks untouched since the same cutoff that were
    /// never charged.
    pub async fn run(&self, now: DateTime<Utc>, dry_run: bool) -> Result<ResumeReport, StoreError> {
        let stale = self
            .service
            .records()
            .stale_processing_tasks(now - self.stale_after, self.limit)
            .await?;
        let mut report = ResumeReport {
            dry_run,
            stale: stale.len(),
            sample_task_ids: stale.iter().take(5).map(|t| t.id).collect(),
            ..ResumeReport::default()
        };
        if dry_run {
            report.unsettled = self.unsettled(now).await?.len();
            return Ok(report);
        }

        for task in stale {
            match self.service.resume(task).await {
                WorkerOutcome::Completed { .. } => report.completed += 1,
                WorkerOutcome::Failed { .. } => report.failed += 1,
                WorkerOutcome::AlreadyTerminal => report.already_terminal += 1,
                WorkerOutcome::Unrecorded { .. } => report.unrecorded += 1,
            }
        }

        let unsettled = self.unsettled(now).await?;
        report.unsettled = unsettled.len();
        for task in &unsettled {
            match self.service.settle(task).await {
                Ok(ChargeOutcome::Charged(_)) => report.charged += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "settlement retry failed");
                    report.settle_errors += 1;
                }
            }
        }

        info!(
            stale = report.stale,
            completed = report.completed,
            failed = report.failed,
            unsettled = report.unsettled,
            charged = report.charged,
            "stale task resume finished"
        );
        Ok(report)
    }

    async fn unsettled(&self, now: DateTime<Utc>) -> Result<Vec<TryOnTask>, StoreError> {
        self.service
            .records()
            .unsettled_completed_tasks(now - self.stale_after, self.limit)
            .await
    }
}

impl fmt::Display for ResumeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "Stale task resume{mode}")?;
        writeln!(f, "  stale tasks: {}", self.stale)?;
        for id in &self.sample_task_ids {
            writeln!(f, "    {id}")?;
        }
        writeln!(f, "  completed but unsettled: {}", self.unsettled)?;
        if self.dry_run {
            return write!(f, "  no changes written");
        }
        writeln!(
            f,
            "  completed: {}  failed: {}  already terminal: {}  unrecorded: {}",
            self.completed, self.failed, self.already_terminal, self.unrecorded
        )?;
        write!(f, "  charged: {}  settlement errors: {}", self.charged, self.settle_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tryon_core::{ItemCategory, QuotaConfig, TaskStatus, TryOnTask, UserAccount, UserId, entitlement};

    use crate::blob::BlobStore;
    use crate::composition::CompositionOutput;
    use crate::store::RecordStore;
    use crate::testing::{Harness, PNG_BYTES};

    async fn stuck_task(h: &Harness, created_at: DateTime<Utc>) -> TryOnTask {
        let account = UserAccount::new(UserId::new());
        h.records.upsert_user(&account).await.unwrap();
        let subject = h.blobs.put("tryon/stuck/subject.png", PNG_BYTES.to_vec(), "image/png").await.unwrap();
        let item = h.blobs.put("tryon/stuck/item.png", PNG_BYTES.to_vec(), "image/png").await.unwrap();
        let plan = entitlement::resolve(&account, &QuotaConfig::default(), created_at).consumption_order;
        let task = TryOnTask::accepted(
            TaskId::new(),
            account.id,
            ItemCategory::Glasses,
            subject.url,
            item.url,
            plan,
            created_at,
            created_at + chrono::Duration::days(7),
        );
        h.records.insert_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn stale_tasks_are_driven_to_terminal_and_charged() {
        let h = Harness::new();
        let now = Utc::now();
        let stuck = stuck_task(&h, now - chrono::Duration::hours(1)).await;
        let fresh = stuck_task(&h, now).await;

        let resumer = StaleTaskResumer::new(h.service.clone(), chrono::Duration::minutes(15), 100);
        let report = resumer.run(now, false).await.unwrap();

        assert_eq!(report.stale, 1);
        assert_eq!(report.completed, 1);
        let task = h.records.get_task(stuck.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.usage_charged);
        let fresh = h.records.get_task(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn completed_task_left_unsettled_is_charged_once() {
        let h = Harness::new();
        let now = Utc::now();
        let done_at = now - chrono::Duration::hours(1);
        let task = stuck_task(&h, done_at).await;
        // Completion recorded, settlement never applied.
        assert!(h.records.complete_task(task.id, &task.subject_url, done_at).await.unwrap());

        let resumer = StaleTaskResumer::new(h.service.clone(), chrono::Duration::minutes(15), 100);
        let preview = resumer.run(now, true).await.unwrap();
        assert_eq!(preview.unsettled, 1);
        assert!(!h.records.get_task(task.id).await.unwrap().unwrap().usage_charged);

        let report = resumer.run(now, false).await.unwrap();
        assert_eq!(report.stale, 0);
        assert_eq!(report.unsettled, 1);
        assert_eq!(report.charged, 1);
        assert_eq!(h.composer.calls(), 0);

        let settled = h.records.get_task(task.id).await.unwrap().unwrap();
        assert!(settled.usage_charged);
        let account = h.records.get_user(task.user_id).await.unwrap().unwrap();
        assert_eq!(account.free_trials_used, 1);

        let again = resumer.run(now, false).await.unwrap();
        assert_eq!(again.unsettled, 0);
        let account = h.records.get_user(task.user_id).await.unwrap().unwrap();
        assert_eq!(account.free_trials_used, 1);
    }

    #[tokio::test]
    async fn dry_run_leaves_tasks_processing() {
        let h = Harness::new();
        let now = Utc::now();
        let stuck = stuck_task(&h, now - chrono::Duration::hours(1)).await;
        h.composer.push(Ok(CompositionOutput::Refusal("unused".into())));

        let report = StaleTaskResumer::new(h.service.clone(), chrono::Duration::minutes(15), 100)
            .run(now, true)
            .await
            .unwrap();

        assert_eq!(report.sample_task_ids, vec![stuck.id]);
        assert_eq!(h.composer.calls(), 0);
        let task = h.records.get_task(stuck.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
    }
}
