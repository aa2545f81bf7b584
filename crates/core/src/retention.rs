//! Data retention windows.
//!
//! | Tier    | Retention |
//! |---------|-----------|
//! | Free    | 7 days    |
//! | Credits | 90 days   |
//! | Premium | 365 days  |
//!
//! The tier is evaluated at the moment the expiry is computed. An expiry,
//! once stored on a task, is never moved.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{SubscriptionPlan, UserAccount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionTier {
    Free,
    Credits,
    Premium,
}

impl RetentionTier {
    /// Active premium wins; otherwise a positive credit balance; otherwise free.
    pub fn for_account(account: &UserAccount, now: DateTime<Utc>) -> Self {
        if account.is_premium_active(now) {
            RetentionTier::Premium
        } else if account.credits_balance() > 0 {
            RetentionTier::Credits
        } else {
            RetentionTier::Free
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            RetentionTier::Free => 7,
            RetentionTier::Credits => 90,
            RetentionTier::Premium => 365,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionTier::Free => "FREE",
            RetentionTier::Credits => "CREDITS",
            RetentionTier::Premium => "PREMIUM",
        }
    }
}

pub fn expires_at(created_at: DateTime<Utc>, tier: RetentionTier) -> DateTime<Utc> {
    created_at + Duration::days(tier.days())
}

/// Customer-facing plan name used in notification emails.
pub fn plan_display_name(account: &UserAccount, now: DateTime<Utc>) -> &'static str {
    if account.is_premium_active(now) {
        match account.effective_plan() {
            SubscriptionPlan::Yearly => "Standard (Annual)",
            SubscriptionPlan::Monthly => "Standard (Monthly)",
        }
    } else if account.credits_balance() > 0 {
        "Credits Pack"
    } else {
        "Free"
    }
}

/// Inputs handed to the email collaborator when a result is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionNotice {
    pub plan_display_name: String,
    pub retention_days: i64,
    pub expires_at: DateTime<Utc>,
}

impl RetentionNotice {
    pub fn for_task(account: &UserAccount, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let tier = RetentionTier::for_account(account, now);
        Self {
            plan_display_name: plan_display_name(account, now).to_string(),
            retention_days: tier.days(),
            expires_at: expires_at(created_at, tier),
        }
    }
}
