//! Sets `expires_at` on legacy tasks that were created without one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tryon_core::{RetentionTier, UserAccount, UserId, retention};

use crate::store::{DynRecordStore, StoreError};

pub struct RetentionBackfill {
    records: DynRecordStore,
    page_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub updated: usize,
    /// Rows that gained an expiry concurrently and were left as found.
    pub skipped: usize,
    pub already_expired: usize,
    pub missing_users: usize,
    pub by_tier: BTreeMap<&'static str, usize>,
}

impl RetentionBackfill {
    pub fn new(records: DynRecordStore, page_size: usize) -> Self {
        Self {
            records,
            page_size: page_size.max(1),
        }
    }

    /// Walk every task without an expiry, oldest id first.
    ///
    /// The write is conditional on the expiry still being absent, so running
    /// this twice, or alongside submissions, never moves an existing value.
    pub async fn run(&self, now: DateTime<Utc>, dry_run: bool) -> Result<BackfillReport, StoreError> {
        let mut report = BackfillReport {
            dry_run,
            ..BackfillReport::default()
        };
        let mut owners: HashMap<UserId, Option<UserAccount>> = HashMap::new();
        let mut after = None;

        loop {
            let page = self.records.tasks_missing_expiry(after, self.page_size).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.id);

            for task in &page {
                report.scanned += 1;

                if !owners.contains_key(&task.user_id) {
                    let account = self.records.get_user(task.user_id).await?;
                    owners.insert(task.user_id, account);
                }
                let tier = match owners.get(&task.user_id).and_then(Option::as_ref) {
                    Some(account) => RetentionTier::for_account(account, now),
                    None => {
                        report.missing_users += 1;
                        RetentionTier::Free
                    }
                };
                *report.by_tier.entry(tier.as_str()).or_default() += 1;

                let expires_at = retention::expires_at(task.created_at, tier);
                if expires_at < now {
                    report.already_expired += 1;
                }
                if dry_run {
                    continue;
                }

                match self.records.set_expiry_if_absent(task.id, expires_at).await {
                    Ok(true) => report.updated += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "could not set expiry; leaving for next run");
                        report.skipped += 1;
                    }
                }
            }

            if page.len() < self.page_size {
                break;
            }
        }

        info!(
            dry_run,
            scanned = report.scanned,
            updated = report.updated,
            already_expired = report.already_expired,
            "retention backfill finished"
        );
        Ok(report)
    }
}

impl fmt::Display for BackfillReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "Retention backfill{mode}")?;
        writeln!(f, "  tasks without expiry: {}", self.scanned)?;
        for (tier, count) in &self.by_tier {
            writeln!(f, "    {tier:<8} {count}")?;
        }
        writeln!(f, "  already past expiry:  {}", self.already_expired)?;
        if self.missing_users > 0 {
            writeln!(f, "  owner missing (free): {}", self.missing_users)?;
        }
        if self.dry_run {
            write!(f, "  no changes written")
        } else {
            write!(f, "  updated: {}  skipped: {}", self.updated, self.skipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use tryon_core::{ItemCategory, TaskId, TryOnTask};

    use crate::store::{InMemoryRecordStore, RecordStore};

    fn legacy_task(user: UserId, created_at: DateTime<Utc>) -> TryOnTask {
        let mut task = TryOnTask::accepted(
            TaskId::new(),
            user,
            ItemCategory::Glasses,
            format!("https://blob.test/tryon/{user}/1-subject.png"),
            format!("https://blob.test/tryon/{user}/1-item.png"),
            Vec::new(),
            created_at,
            created_at,
        );
        task.expires_at = None;
        task
    }

    async fn setup() -> (Arc<InMemoryRecordStore>, UserAccount) {
        let records = Arc::new(InMemoryRecordStore::new());
        let account = UserAccount::new(UserId::new());
        records.upsert_user(&account).await.unwrap();
        (records, account)
    }

    #[tokio::test]
    async fn free_task_gets_seven_days_exactly_once() {
        let (records, account) = setup().await;
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let task = legacy_task(account.id, created);
        records.insert_task(&task).await.unwrap();

        let job = RetentionBackfill::new(records.clone(), 10);
        let now = created + Duration::days(1);
        let first = job.run(now, false).await.unwrap();
        assert_eq!(first.updated, 1);
        assert_eq!(first.by_tier.get("FREE"), Some(&1));

        let stored = records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(created + Duration::days(7)));

        let second = job.run(now + Duration::days(1), false).await.unwrap();
        assert_eq!(second.scanned, 0);
        let stored = records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(created + Duration::days(7)));
    }

    #[tokio::test]
    async fn existing_expiry_is_never_touched() {
        let (records, account) = setup().await;
        let created = Utc::now();
        let mut task = legacy_task(account.id, created);
        task.expires_at = Some(created + Duration::days(365));
        records.insert_task(&task).await.unwrap();

        let report = RetentionBackfill::new(records.clone(), 10).run(created, false).await.unwrap();

        assert_eq!(report.scanned, 0);
        let stored = records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(created + Duration::days(365)));
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing_across_pages() {
        let (records, account) = setup().await;
        let now = Utc::now();
        for days_ago in [1, 2, 30] {
            records
                .insert_task(&legacy_task(account.id, now - Duration::days(days_ago)))
                .await
                .unwrap();
        }

        let report = RetentionBackfill::new(records.clone(), 2).run(now, true).await.unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.already_expired, 1);
        assert_eq!(report.updated, 0);
        let pending = records.tasks_missing_expiry(None, 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert!(report.to_string().contains("no changes written"));
    }

    #[tokio::test]
    async fn credit_holders_get_ninety_days() {
        let (records, mut account) = setup().await;
        account.credits_purchased = 30;
        records.upsert_user(&account).await.unwrap();
        let created = Utc::now();
        let task = legacy_task(account.id, created);
        records.insert_task(&task).await.unwrap();

        RetentionBackfill::new(records.clone(), 10).run(created, false).await.unwrap();

        let stored = records.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.expires_at, Some(created + Duration::days(90)));
    }
}
