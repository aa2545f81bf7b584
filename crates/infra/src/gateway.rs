//! Task submission: entitlement gate, payload validation, upload, task creation.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tryon_core::{
    ContentFingerprint, DomainError, ItemCategory, QuotaConfig, RetentionTier, TaskId, TryOnTask,
    UserId, entitlement, retention,
};

use crate::blob::{self, BlobError, DynBlobStore};
use crate::store::{DynRecordStore, StoreError};

/// Errors on the request path. Nothing here is recorded on a task.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upload failed: {0}")]
    Blob(#[from] BlobError),
}

/// One uploaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub bytes: Vec<u8>,
    /// Declared by the client; sniffed from the bytes when absent.
    pub content_type: Option<String>,
}

impl Upload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: None,
        }
    }

    fn content_type(&self) -> &str {
        self.content_type
            .as_deref()
            .filter(|ct| ct.starts_with("image/"))
            .unwrap_or_else(|| blob::sniff_content_type(&self.bytes))
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub user: UserId,
    pub subject: Option<Upload>,
    pub item: Option<Upload>,
    pub category: ItemCategory,
}

#[derive(Clone)]
pub struct SubmissionGateway {
    records: DynRecordStore,
    blobs: DynBlobStore,
    quotas: QuotaConfig,
    max_upload_bytes: usize,
}

impl SubmissionGateway {
    pub fn new(records: DynRecordStore, blobs: DynBlobStore, quotas: QuotaConfig, max_upload_bytes: usize) -> Self {
        Self {
            records,
            blobs,
            quotas,
            max_upload_bytes,
        }
    }

    /// Accept a submission and persist it as a `PROCESSING` task.
    ///
    /// The entitlement check runs before anything is uploaded, so a rejected
    /// request leaves no trace in either store.
    pub async fn submit(&self, submission: Submission, now: DateTime<Utc>) -> Result<TryOnTask, SubmitError> {
        let account = self.records.ensure_user(submission.user).await?;
        let entitlement = entitlement::resolve(&account, &self.quotas, now);
        if let Err(err) = entitlement.ensure_available() {
            info!(user_id = %submission.user, tier = ?entitlement.tier, "submission rejected: quota exhausted");
            return Err(err.into());
        }

        let subject = self.validate("subjectImage", submission.subject)?;
        let item = self.validate("itemImage", submission.item)?;

        let subject_fp = ContentFingerprint::of(&subject.bytes);
        let item_fp = ContentFingerprint::of(&item.bytes);
        if subject_fp == item_fp {
            warn!(
                user_id = %submission.user,
                fingerprint = %subject_fp,
                "subject and item images look identical"
            );
        }

        let task_id = TaskId::new();
        let timestamp = now.timestamp_millis();
        let subject_type = subject.content_type().to_string();
        let item_type = item.content_type().to_string();
        let subject_path =
            blob::subject_path(submission.user, task_id, timestamp, blob::extension_for(&subject_type));
        let item_path = blob::item_path(submission.user, task_id, timestamp, blob::extension_for(&item_type));

        let stored_subject = self.blobs.put(&subject_path, subject.bytes, &subject_type).await?;
        let stored_item = self.blobs.put(&item_path, item.bytes, &item_type).await?;

        let tier = RetentionTier::for_account(&account, now);
        let task = TryOnTask::accepted(
            task_id,
            submission.user,
            submission.category,
            stored_subject.url,
            stored_item.url,
            entitlement.consumption_order,
            now,
            retention::expires_at(now, tier),
        );
        self.records.insert_task(&task).await?;

        info!(
            task_id = %task.id,
            user_id = %task.user_id,
            category = task.category.as_str(),
            retention = tier.as_str(),
            remaining = entitlement.remaining,
            "task accepted"
        );
        Ok(task)
    }

    fn validate(&self, field: &str, upload: Option<Upload>) -> Result<Upload, DomainError> {
        let upload = upload
            .filter(|u| !u.bytes.is_empty())
            .ok_or_else(|| DomainError::validation(format!("{field} is required")))?;
        if upload.bytes.len() > self.max_upload_bytes {
            return Err(DomainError::validation(format!(
                "{field} is {} bytes; the limit is {} bytes",
                upload.bytes.len(),
                self.max_upload_bytes
            )));
        }
        Ok(upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tryon_core::{TaskStatus, UserAccount};

    use crate::blob::InMemoryBlobStore;
    use crate::store::{InMemoryRecordStore, RecordStore};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];

    fn gateway() -> (SubmissionGateway, Arc<InMemoryRecordStore>, Arc<InMemoryBlobStore>) {
        let records = Arc::new(InMemoryRecordStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new("https://blob.test"));
        let gw = SubmissionGateway::new(records.clone(), blobs.clone(), QuotaConfig::default(), 1024 * 1024);
        (gw, records, blobs)
    }

    fn submission(user: UserId) -> Submission {
        Submission {
            user,
            subject: Some(Upload::new(PNG.to_vec())),
            item: Some(Upload::new(vec![0xFF, 0xD8, 0xFF, 0xE0, 9])),
            category: ItemCategory::Glasses,
        }
    }

    #[tokio::test]
    async fn accepted_task_is_processing_with_expiry_and_plan() {
        let (gw, records, blobs) = gateway();
        let user = UserId::new();
        let now = Utc::now();

        let task = gw.submit(submission(user), now).await.unwrap();

        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.expires_at, Some(now + chrono::Duration::days(7)));
        assert_eq!(task.charge_plan.len(), 1);
        assert!(task.subject_url.ends_with("-subject.png"));
        assert!(task.item_url.ends_with("-item.jpg"));
        assert_eq!(blobs.len(), 2);
        assert!(records.get_task(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn both_uploads_share_one_timestamp() {
        let (gw, _, _) = gateway();
        let now = Utc::now();
        let task = gw.submit(submission(UserId::new()), now).await.unwrap();
        let stamp = format!("/{}-", now.timestamp_millis());
        assert!(task.subject_url.contains(&stamp));
        assert!(task.item_url.contains(&stamp));
    }

    #[tokio::test]
    async fn same_millisecond_submissions_keep_separate_originals() {
        let (gw, records, blobs) = gateway();
        let mut account = UserAccount::new(UserId::new());
        account.credits_purchased = 30;
        records.upsert_user(&account).await.unwrap();
        let now = Utc::now();

        let first = gw.submit(submission(account.id), now).await.unwrap();
        let second = gw.submit(submission(account.id), now).await.unwrap();

        assert_ne!(first.subject_url, second.subject_url);
        assert_ne!(first.item_url, second.item_url);
        assert_eq!(blobs.len(), 4);
    }

    #[tokio::test]
    async fn exhausted_quota_rejects_before_any_upload() {
        let (gw, records, blobs) = gateway();
        let mut account = UserAccount::new(UserId::new());
        account.free_trials_used = 1;
        records.upsert_user(&account).await.unwrap();

        let err = gw.submit(submission(account.id), Utc::now()).await.unwrap_err();

        assert!(matches!(err, SubmitError::Domain(DomainError::QuotaExhausted(_))));
        assert!(blobs.is_empty());
        assert_eq!(records.task_counts(account.id).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn missing_or_oversized_payloads_are_rejected() {
        let (gw, _, blobs) = gateway();

        let mut missing = submission(UserId::new());
        missing.item = None;
        assert!(matches!(
            gw.submit(missing, Utc::now()).await,
            Err(SubmitError::Domain(DomainError::Validation(msg))) if msg.contains("itemImage")
        ));

        let mut oversized = submission(UserId::new());
        oversized.subject = Some(Upload::new(vec![0; 1024 * 1024 + 1]));
        assert!(matches!(
            gw.submit(oversized, Utc::now()).await,
            Err(SubmitError::Domain(DomainError::Validation(_)))
        ));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn identical_images_are_accepted() {
        let (gw, _, _) = gateway();
        let mut same = submission(UserId::new());
        same.item = same.subject.clone();
        assert!(gw.submit(same, Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn credits_holder_gets_ninety_day_retention() {
        let (gw, records, _) = gateway();
        let mut account = UserAccount::new(UserId::new());
        account.credits_purchased = 30;
        records.upsert_user(&account).await.unwrap();
        let now = Utc::now();

        let task = gw.submit(submission(account.id), now).await.unwrap();
        assert_eq!(task.expires_at, Some(now + chrono::Duration::days(90)));
    }
}
