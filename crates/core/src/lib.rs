//! `tryon-core`: domain model for usage accounting and the try-on task lifecycle.
//!
//! This crate contains **pure domain** logic (no infrastructure concerns):
//! entitlement resolution, retention windows, content fingerprints and the
//! task state model.

pub mod account;
pub mod entitlement;
pub mod error;
pub mod fingerprint;
pub mod id;
pub mod retention;
pub mod task;

pub use account::{SubscriptionPlan, UserAccount};
pub use entitlement::{ChargeStep, Entitlement, QuotaConfig, SubTier, Tier};
pub use error::{DomainError, DomainResult};
pub use fingerprint::ContentFingerprint;
pub use id::{TaskId, UserId};
pub use retention::{RetentionNotice, RetentionTier};
pub use task::{ItemCategory, TaskStatus, TaskView, TryOnTask};
