//! Account holder state relevant to usage accounting.
//!
//! The counters on [`UserAccount`] only ever move forward. Payment and
//! subscription changes arrive from outside the engine and are applied through
//! [`UserAccount::grant_credits`] and [`UserAccount::activate_subscription`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;

/// Recurring subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Monthly,
    Yearly,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Monthly => "monthly",
            SubscriptionPlan::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "monthly" | "premium_monthly" => Ok(SubscriptionPlan::Monthly),
            "yearly" | "premium_yearly" => Ok(SubscriptionPlan::Yearly),
            other => Err(DomainError::validation(format!(
                "unknown subscription plan '{other}'"
            ))),
        }
    }
}

/// Usage-relevant view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: UserId,
    pub is_premium: bool,
    pub premium_expires_at: Option<DateTime<Utc>>,
    pub subscription_plan: Option<SubscriptionPlan>,
    pub free_trials_used: i64,
    pub premium_usage_count: i64,
    pub credits_purchased: i64,
    pub credits_used: i64,
    /// Profile image URL, if the user uploaded one to the object store.
    pub image: Option<String>,
}

impl UserAccount {
    /// A fresh free-tier account with untouched counters.
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            is_premium: false,
            premium_expires_at: None,
            subscription_plan: None,
            free_trials_used: 0,
            premium_usage_count: 0,
            credits_purchased: 0,
            credits_used: 0,
            image: None,
        }
    }

    /// Premium counts only while the flag is set and the paid period has not lapsed.
    pub fn is_premium_active(&self, now: DateTime<Utc>) -> bool {
        self.is_premium && self.premium_expires_at.is_none_or(|at| at > now)
    }

    /// Plan used for quota lookups. Accounts without a recorded plan are monthly.
    pub fn effective_plan(&self) -> SubscriptionPlan {
        self.subscription_plan.unwrap_or(SubscriptionPlan::Monthly)
    }

    pub fn credits_balance(&self) -> i64 {
        (self.credits_purchased - self.credits_used).max(0)
    }

    /// Apply a completed credits purchase.
    pub fn grant_credits(&mut self, amount: i64) -> DomainResult<()> {
        if amount <= 0 {
            return Err(DomainError::validation("credit grant must be positive"));
        }
        self.credits_purchased += amount;
        Ok(())
    }

    /// Apply a subscription activation or renewal.
    pub fn activate_subscription(&mut self, plan: SubscriptionPlan, expires_at: Option<DateTime<Utc>>) {
        self.is_premium = true;
        self.subscription_plan = Some(plan);
        self.premium_expires_at = expires_at;
    }

    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.free_trials_used < 0 || self.premium_usage_count < 0 || self.credits_used < 0 {
            return Err(DomainError::invariant("usage counters must be non-negative"));
        }
        if self.credits_used > self.credits_purchased {
            return Err(DomainError::invariant(format!(
                "credits_used ({}) exceeds credits_purchased ({})",
                self.credits_used, self.credits_purchased
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn premium_without_expiry_is_active() {
        let mut account = UserAccount::new(UserId::new());
        account.activate_subscription(SubscriptionPlan::Monthly, None);
        assert!(account.is_premium_active(Utc::now()));
    }

    #[test]
    fn lapsed_premium_is_inactive() {
        let now = Utc::now();
        let mut account = UserAccount::new(UserId::new());
        account.activate_subscription(SubscriptionPlan::Yearly, Some(now - Duration::days(1)));
        assert!(!account.is_premium_active(now));
    }

    #[test]
    fn missing_plan_defaults_to_monthly() {
        let mut account = UserAccount::new(UserId::new());
        account.is_premium = true;
        assert_eq!(account.effective_plan(), SubscriptionPlan::Monthly);
    }

    #[test]
    fn credit_grants_must_be_positive() {
        let mut account = UserAccount::new(UserId::new());
        assert!(account.grant_credits(0).is_err());
        account.grant_credits(30).unwrap();
        assert_eq!(account.credits_balance(), 30);
    }

    #[test]
    fn overspent_credits_violate_invariants() {
        let mut account = UserAccount::new(UserId::new());
        account.credits_used = 1;
        assert!(matches!(
            account.check_invariants(),
            Err(DomainError::InvariantViolation(_))
        ));
    }
}
