//! Usage settlement after a task reaches a terminal state.

use std::sync::Arc;

use tracing::{info, warn};

use tryon_core::TryOnTask;

use crate::cache::FiguresCache;
use crate::store::{ChargeOutcome, DynRecordStore, StoreError};

#[derive(Clone)]
pub struct UsageLedger {
    records: DynRecordStore,
    cache: Arc<FiguresCache>,
}

impl UsageLedger {
    pub fn new(records: DynRecordStore, cache: Arc<FiguresCache>) -> Self {
        Self { records, cache }
    }

    /// Charge one unit for a completed task, at most once.
    ///
    /// The owner's cached figures are dropped before returning whenever the
    /// settlement changed something they show.
    pub async fn settle(&self, task: &TryOnTask) -> Result<ChargeOutcome, StoreError> {
        let outcome = self.records.charge_usage(task.id).await?;

        match outcome {
            ChargeOutcome::Charged(sub_tier) => {
                info!(task_id = %task.id, user_id = %task.user_id, sub_tier = sub_tier.as_str(), "usage charged");
            }
            ChargeOutcome::NoAllowance => {
                warn!(task_id = %task.id, user_id = %task.user_id, "completed task could not be charged; allowance gone");
            }
            ChargeOutcome::NotCompleted => {
                info!(task_id = %task.id, "task not completed; nothing charged");
            }
            ChargeOutcome::AlreadyCharged => return Ok(outcome),
        }

        self.cache.invalidate_user(task.user_id);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use tryon_core::{
        ItemCategory, QuotaConfig, SubTier, SubscriptionPlan, TaskId, UserAccount, UserId,
        entitlement::resolve,
    };

    use crate::cache::UserFigures;
    use crate::store::{InMemoryRecordStore, RecordStore};

    async fn setup(account: &UserAccount) -> (UsageLedger, Arc<InMemoryRecordStore>, Arc<FiguresCache>, TryOnTask) {
        let records = Arc::new(InMemoryRecordStore::new());
        records.upsert_user(account).await.unwrap();
        let cache = Arc::new(FiguresCache::new(Duration::from_secs(60)));
        let now = Utc::now();
        let task = TryOnTask::accepted(
            TaskId::new(),
            account.id,
            ItemCategory::Outfit,
            "https://blob.test/tryon/s.png".into(),
            "https://blob.test/tryon/i.png".into(),
            resolve(account, &QuotaConfig::default(), now).consumption_order,
            now,
            now,
        );
        records.insert_task(&task).await.unwrap();
        (UsageLedger::new(records.clone(), cache.clone()), records, cache, task)
    }

    fn figures() -> UserFigures {
        UserFigures {
            tier: tryon_core::Tier::Free,
            remaining: 1,
            credits_balance: 0,
            plan_display_name: "Free".into(),
            retention_days: 7,
            total_tasks: 0,
            completed_tasks: 0,
        }
    }

    #[tokio::test]
    async fn failed_task_is_never_charged() {
        let account = UserAccount::new(UserId::new());
        let (ledger, records, _, task) = setup(&account).await;
        records.fail_task(task.id, "refused", Utc::now()).await.unwrap();

        assert_eq!(ledger.settle(&task).await.unwrap(), ChargeOutcome::NotCompleted);
        assert_eq!(records.get_user(account.id).await.unwrap().unwrap().free_trials_used, 0);
    }

    #[tokio::test]
    async fn settling_twice_charges_once_and_invalidates_cache() {
        let mut account = UserAccount::new(UserId::new());
        account.activate_subscription(SubscriptionPlan::Monthly, None);
        account.credits_purchased = 3;
        let (ledger, records, cache, task) = setup(&account).await;
        records.complete_task(task.id, "https://blob.test/r.png", Utc::now()).await.unwrap();
        cache.insert(account.id, figures());

        assert_eq!(
            ledger.settle(&task).await.unwrap(),
            ChargeOutcome::Charged(SubTier::Subscription)
        );
        assert_eq!(cache.get(account.id), None);

        cache.insert(account.id, figures());
        assert_eq!(ledger.settle(&task).await.unwrap(), ChargeOutcome::AlreadyCharged);
        assert!(cache.get(account.id).is_some());

        let after = records.get_user(account.id).await.unwrap().unwrap();
        assert_eq!(after.premium_usage_count, 1);
        assert_eq!(after.credits_used, 0);
    }

    #[tokio::test]
    async fn concurrent_settlements_charge_once() {
        let mut account = UserAccount::new(UserId::new());
        account.credits_purchased = 5;
        let (ledger, records, _, task) = setup(&account).await;
        records.complete_task(task.id, "https://blob.test/r.png", Utc::now()).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let task = task.clone();
                tokio::spawn(async move { ledger.settle(&task).await.unwrap() })
            })
            .collect();

        let mut charged = 0;
        for h in handles {
            if matches!(h.await.unwrap(), ChargeOutcome::Charged(_)) {
                charged += 1;
            }
        }
        assert_eq!(charged, 1);
        assert_eq!(records.get_user(account.id).await.unwrap().unwrap().credits_used, 1);
    }

    #[tokio::test]
    async fn guard_failure_leaves_counters_unchanged() {
        let account = UserAccount::new(UserId::new());
        let (ledger, records, _, task) = setup(&account).await;

        // Trial consumed by another task between submission and settlement.
        let mut drained = account.clone();
        drained.free_trials_used = 1;
        records.upsert_user(&drained).await.unwrap();
        records.complete_task(task.id, "https://blob.test/r.png", Utc::now()).await.unwrap();

        assert_eq!(ledger.settle(&task).await.unwrap(), ChargeOutcome::NoAllowance);
        let after = records.get_user(account.id).await.unwrap().unwrap();
        assert_eq!(after.free_trials_used, 1);
        assert_eq!(after.credits_used, 0);
    }
}
