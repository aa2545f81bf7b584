//! Finds and removes stored objects that no record refers to.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::pacing::{BatchDeleter, BatchReport};
use crate::blob::{DynBlobStore, StoredBlob};
use crate::store::{DynRecordStore, StoreError};

pub struct OrphanReconciler {
    records: DynRecordStore,
    blobs: DynBlobStore,
    deleter: BatchDeleter,
    prefixes: Vec<String>,
    page_size: usize,
    min_age: chrono::Duration,
    samples: usize,
}

/// Result of diffing the object store against the record store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanScan {
    pub listed: usize,
    pub referenced: usize,
    pub orphans: Vec<StoredBlob>,
    /// Unreferenced but younger than the minimum age.
    pub too_recent: usize,
    /// Prefixes whose listing failed part-way; their remaining pages were not seen.
    pub listing_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub dry_run: bool,
    pub listed: usize,
    pub orphan_count: usize,
    pub orphan_bytes: u64,
    pub too_recent: usize,
    pub listing_errors: usize,
    pub sample_paths: Vec<String>,
    pub deletion: Option<BatchReport>,
    /// Size of the orphans whose batch succeeded.
    pub bytes_freed: u64,
}

impl OrphanReconciler {
    pub fn new(
        records: DynRecordStore,
        blobs: DynBlobStore,
        deleter: BatchDeleter,
        prefixes: Vec<String>,
        page_size: usize,
        min_age: chrono::Duration,
        samples: usize,
    ) -> Self {
        Self {
            records,
            blobs,
            deleter,
            prefixes,
            page_size: page_size.max(1),
            min_age,
            samples,
        }
    }

    /// List every managed object and keep those no task or profile refers to.
    ///
    /// The reference set must load completely; a partial set would make live
    /// payloads look orphaned.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<OrphanScan, StoreError> {
        let referenced: HashSet<String> = self.records.referenced_urls().await?;
        let cutoff = now - self.min_age;
        let mut scan = OrphanScan {
            referenced: referenced.len(),
            ..OrphanScan::default()
        };

        for prefix in &self.prefixes {
            let mut cursor = None;
            loop {
                let page = match self.blobs.list(prefix, cursor.take(), self.page_size).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "listing failed; skipping rest of prefix");
                        scan.listing_errors += 1;
                        break;
                    }
                };
                scan.listed += page.blobs.len();
                for blob in page.blobs {
                    if referenced.contains(&blob.url) {
                        continue;
                    }
                    if blob.uploaded_at > cutoff {
                        scan.too_recent += 1;
                    } else {
                        scan.orphans.push(blob);
                    }
                }
                match page.cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(scan)
    }

    pub async fn run(&self, now: DateTime<Utc>, dry_run: bool) -> Result<OrphanReport, StoreError> {
        let scan = self.scan(now).await?;
        let mut report = OrphanReport {
            dry_run,
            listed: scan.listed,
            orphan_count: scan.orphans.len(),
            orphan_bytes: scan.orphans.iter().map(|b| b.size).sum(),
            too_recent: scan.too_recent,
            listing_errors: scan.listing_errors,
            sample_paths: scan
                .orphans
                .iter()
                .take(self.samples)
                .map(|b| b.pathname.clone())
                .collect(),
            deletion: None,
            bytes_freed: 0,
        };

        if !dry_run && !scan.orphans.is_empty() {
            let urls: Vec<String> = scan.orphans.iter().map(|b| b.url.clone()).collect();
            let deletion = self.deleter.delete_all(self.blobs.as_ref(), &urls).await;
            let failed: HashSet<&str> = deletion.failed_urls.iter().map(String::as_str).collect();
            report.bytes_freed = scan
                .orphans
                .iter()
                .filter(|b| !failed.contains(b.url.as_str()))
                .map(|b| b.size)
                .sum();
            report.deletion = Some(deletion);
        }

        info!(
            dry_run,
            listed = report.listed,
            orphans = report.orphan_count,
            bytes = report.orphan_bytes,
            "orphan reconciliation finished"
        );
        Ok(report)
    }
}

impl fmt::Display for OrphanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "Orphaned object reconciliation{mode}")?;
        writeln!(f, "  objects listed: {}", self.listed)?;
        writeln!(f, "  orphans:        {} ({})", self.orphan_count, super::human_bytes(self.orphan_bytes))?;
        for path in &self.sample_paths {
            writeln!(f, "    {path}")?;
        }
        if self.too_recent > 0 {
            writeln!(f, "  too recent:     {} (kept)", self.too_recent)?;
        }
        if self.listing_errors > 0 {
            writeln!(f, "  listing errors: {}", self.listing_errors)?;
        }
        match &self.deletion {
            None if self.dry_run => write!(f, "  no changes written"),
            None => write!(f, "  nothing to delete"),
            Some(d) => write!(
                f,
                "  deleted:        {} in {} batches ({} failed), {} freed",
                d.deleted,
                d.batches,
                d.failed_batches,
                super::human_bytes(self.bytes_freed)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tryon_core::{ItemCategory, TaskId, TryOnTask, UserAccount, UserId};

    use crate::blob::{BlobStore, InMemoryBlobStore};
    use crate::store::{InMemoryRecordStore, RecordStore};

    struct Fixture {
        records: Arc<InMemoryRecordStore>,
        blobs: Arc<InMemoryBlobStore>,
        reconciler: OrphanReconciler,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let records = Arc::new(InMemoryRecordStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new("https://blob.test"));
        let reconciler = OrphanReconciler::new(
            records.clone(),
            blobs.clone(),
            BatchDeleter::new(batch_size, Duration::ZERO, Duration::ZERO),
            vec!["tryon/".into(), "try-on/".into()],
            2,
            chrono::Duration::hours(1),
            5,
        );
        Fixture {
            records,
            blobs,
            reconciler,
        }
    }

    async fn aged_blob(fx: &Fixture, path: &str) -> String {
        let stored = fx.blobs.put(path, vec![0; 10], "image/png").await.unwrap();
        fx.blobs.set_uploaded_at(&stored.url, Utc::now() - chrono::Duration::days(2));
        stored.url
    }

    /// Records reference A and B; storage holds A, B and C.
    async fn seeded(fx: &Fixture) -> (String, String, String) {
        let user = UserId::new();
        let a = aged_blob(fx, &format!("tryon/{user}/1-subject.png")).await;
        let b = aged_blob(fx, &format!("tryon/{user}/1-item.png")).await;
        let c = aged_blob(fx, &format!("tryon/{user}/0-subject.png")).await;

        fx.records.upsert_user(&UserAccount::new(user)).await.unwrap();
        let now = Utc::now();
        let task = TryOnTask::accepted(TaskId::new(), user, ItemCategory::Outfit, a.clone(), b.clone(), Vec::new(), now, now);
        fx.records.insert_task(&task).await.unwrap();
        (a, b, c)
    }

    #[tokio::test]
    async fn dry_run_reports_the_unreferenced_object_only() {
        let fx = fixture(50);
        let (a, b, c) = seeded(&fx).await;

        let report = fx.reconciler.run(Utc::now(), true).await.unwrap();

        assert_eq!(report.listed, 3);
        assert_eq!(report.orphan_count, 1);
        assert_eq!(report.orphan_bytes, 10);
        assert!(report.sample_paths[0].ends_with("0-subject.png"));
        assert_eq!(report.deletion, None);
        assert_eq!(fx.blobs.delete_calls(), 0);
        for url in [&a, &b, &c] {
            assert!(fx.blobs.contains_url(url));
        }
    }

    #[tokio::test]
    async fn live_run_deletes_only_the_orphan() {
        let fx = fixture(50);
        let (a, b, c) = seeded(&fx).await;

        let report = fx.reconciler.run(Utc::now(), false).await.unwrap();

        assert_eq!(report.deletion.as_ref().map(|d| d.deleted), Some(1));
        assert!(fx.blobs.contains_url(&a));
        assert!(fx.blobs.contains_url(&b));
        assert!(!fx.blobs.contains_url(&c));
    }

    #[tokio::test]
    async fn recent_uploads_and_profile_images_are_kept() {
        let fx = fixture(50);
        let user = UserId::new();
        let fresh = fx.blobs.put("tryon/in-flight.png", vec![1], "image/png").await.unwrap();
        let avatar = aged_blob(&fx, "try-on/avatars/me.png").await;
        let mut account = UserAccount::new(user);
        account.image = Some(avatar.clone());
        fx.records.upsert_user(&account).await.unwrap();

        let report = fx.reconciler.run(Utc::now(), false).await.unwrap();

        assert_eq!(report.orphan_count, 0);
        assert_eq!(report.too_recent, 1);
        assert!(fx.blobs.contains_url(&fresh.url));
        assert!(fx.blobs.contains_url(&avatar));
    }

    #[tokio::test]
    async fn unmanaged_prefixes_are_not_listed() {
        let fx = fixture(50);
        let other = aged_blob(&fx, "marketing/hero.png").await;

        let report = fx.reconciler.run(Utc::now(), false).await.unwrap();

        assert_eq!(report.listed, 0);
        assert!(fx.blobs.contains_url(&other));
    }

    #[tokio::test]
    async fn paginates_and_isolates_failed_batches() {
        let fx = fixture(2);
        for n in 0..5 {
            aged_blob(&fx, &format!("tryon/old/{n}.png")).await;
        }
        fx.blobs.fail_next_deletes(1);

        let report = fx.reconciler.run(Utc::now(), false).await.unwrap();

        assert_eq!(report.listed, 5);
        let deletion = report.deletion.unwrap();
        assert_eq!(deletion.batches, 3);
        assert_eq!(deletion.failed_batches, 1);
        assert_eq!(deletion.deleted, 3);
        assert_eq!(report.bytes_freed, 30);
        assert_eq!(fx.blobs.len(), 2);
    }
}
