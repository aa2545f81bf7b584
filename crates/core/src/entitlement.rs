//! Entitlement resolution: who may run a try-on, and which counter pays for it.
//!
//! Resolution is pure. The resulting consumption order is persisted on the task
//! at submission time so the ledger charges against the same plan even if the
//! account changes tier while the task is processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{SubscriptionPlan, UserAccount};
use crate::error::{DomainError, DomainResult};

/// Per-tier allowances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub free_trial_limit: i64,
    pub monthly_quota: i64,
    pub yearly_quota: i64,
    /// Credits granted by one pack purchase.
    pub credits_pack: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_trial_limit: 1,
            monthly_quota: 90,
            yearly_quota: 1260,
            credits_pack: 30,
        }
    }
}

impl QuotaConfig {
    pub fn plan_quota(&self, plan: SubscriptionPlan) -> i64 {
        match plan {
            SubscriptionPlan::Monthly => self.monthly_quota,
            SubscriptionPlan::Yearly => self.yearly_quota,
        }
    }
}

/// Top-level tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Free,
    Premium,
}

/// Counter a single try-on can be charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTier {
    Subscription,
    Credits,
    FreeTrial,
}

impl SubTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTier::Subscription => "subscription",
            SubTier::Credits => "credits",
            SubTier::FreeTrial => "free_trial",
        }
    }
}

/// One entry of a consumption order.
///
/// `limit` is the ceiling the counter must stay below for the charge to apply.
/// Credits carry no fixed limit: they are guarded by the live purchased total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeStep {
    pub sub_tier: SubTier,
    pub limit: Option<i64>,
}

impl ChargeStep {
    pub fn subscription(quota: i64) -> Self {
        Self {
            sub_tier: SubTier::Subscription,
            limit: Some(quota),
        }
    }

    pub fn credits() -> Self {
        Self {
            sub_tier: SubTier::Credits,
            limit: None,
        }
    }

    pub fn free_trial(limit: i64) -> Self {
        Self {
            sub_tier: SubTier::FreeTrial,
            limit: Some(limit),
        }
    }

    /// Guarded increment against an in-memory account.
    ///
    /// Returns `false` and leaves the account untouched when the guard fails.
    /// Persistent stores express the same guard in a single conditional UPDATE.
    pub fn apply(&self, account: &mut UserAccount) -> bool {
        match self.sub_tier {
            SubTier::Subscription => {
                let limit = self.limit.unwrap_or(0);
                if account.premium_usage_count < limit {
                    account.premium_usage_count += 1;
                    return true;
                }
            }
            SubTier::Credits => {
                if account.credits_used < account.credits_purchased {
                    account.credits_used += 1;
                    return true;
                }
            }
            SubTier::FreeTrial => {
                let limit = self.limit.unwrap_or(0);
                if account.free_trials_used < limit {
                    account.free_trials_used += 1;
                    return true;
                }
            }
        }
        false
    }
}

/// Outcome of resolving an account against the quota table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub tier: Tier,
    pub remaining: i64,
    /// Sub-tiers with a positive allowance, in the order they are consumed.
    pub consumption_order: Vec<ChargeStep>,
}

impl Entitlement {
    pub fn has_allowance(&self) -> bool {
        self.remaining > 0
    }

    /// Gate a request before any upload or external call.
    pub fn ensure_available(&self) -> DomainResult<()> {
        if self.has_allowance() {
            return Ok(());
        }
        let msg = match self.tier {
            Tier::Free => {
                "no free try-ons or credits left; purchase a credits pack or upgrade to premium to continue"
            }
            Tier::Premium => {
                "subscription quota and credits are used up for this period; purchase a credits pack to continue"
            }
        };
        Err(DomainError::quota_exhausted(msg))
    }
}

/// Resolve the entitlement of `account` at `now`.
///
/// Premium accounts consume their subscription quota before credits. Free
/// accounts consume credits before their free trial.
pub fn resolve(account: &UserAccount, quotas: &QuotaConfig, now: DateTime<Utc>) -> Entitlement {
    let credits_remaining = account.credits_balance();

    if account.is_premium_active(now) {
        let quota = quotas.plan_quota(account.effective_plan());
        let subscription_remaining = (quota - account.premium_usage_count).max(0);

        let mut order = Vec::with_capacity(2);
        if subscription_remaining > 0 {
            order.push(ChargeStep::subscription(quota));
        }
        if credits_remaining > 0 {
            order.push(ChargeStep::credits());
        }

        return Entitlement {
            tier: Tier::Premium,
            remaining: subscription_remaining + credits_remaining,
            consumption_order: order,
        };
    }

    let free_remaining = (quotas.free_trial_limit - account.free_trials_used).max(0);

    let mut order = Vec::with_capacity(2);
    if credits_remaining > 0 {
        order.push(ChargeStep::credits());
    }
    if free_remaining > 0 {
        order.push(ChargeStep::free_trial(quotas.free_trial_limit));
    }

    Entitlement {
        tier: Tier::Free,
        remaining: credits_remaining + free_remaining,
        consumption_order: order,
    }
}

/// Charge the first step of `order` whose guard holds.
pub fn charge_first_available(order: &[ChargeStep], account: &mut UserAccount) -> Option<SubTier> {
    order
        .iter()
        .find_map(|step| step.apply(account).then_some(step.sub_tier))
}
