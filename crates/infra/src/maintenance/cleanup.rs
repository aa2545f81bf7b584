//! Removes expired tasks together with their stored payloads.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use tryon_core::TaskId;

use super::pacing::{BatchDeleter, BatchReport};
use crate::blob::DynBlobStore;
use crate::store::{DynRecordStore, StoreError};

pub struct CleanupJob {
    records: DynRecordStore,
    blobs: DynBlobStore,
    deleter: BatchDeleter,
    samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub expired_tasks: usize,
    pub sample_task_ids: Vec<TaskId>,
    pub owned_urls: usize,
    /// Payload URLs outside the object store; never deleted.
    pub foreign_urls: usize,
    /// Combined size of the owned payloads that could be looked up.
    pub owned_bytes: u64,
    /// Owned URLs whose size could not be read; they still get deleted.
    pub unsized_urls: usize,
    pub blobs: BatchReport,
    pub bytes_freed: u64,
    pub records_deleted: u64,
}

impl CleanupJob {
    pub fn new(records: DynRecordStore, blobs: DynBlobStore, deleter: BatchDeleter, samples: usize) -> Self {
        Self {
            records,
            blobs,
            deleter,
            samples,
        }
    }

    /// Select terminal tasks past `expires_at`, delete their payloads in paced
    /// batches, then delete the records.
    ///
    /// Records are removed even when some payload batches failed; whatever is
    /// left in the object store is picked up by the orphan reconciler.
    pub async fn run(&self, now: DateTime<Utc>, dry_run: bool) -> Result<CleanupReport, StoreError> {
        let expired = self.records.expired_terminal_tasks(now).await?;

        let (owned, foreign): (Vec<String>, Vec<String>) = expired
            .iter()
            .flat_map(|t| t.payload_urls())
            .map(str::to_string)
            .partition(|url| self.blobs.owns(url));

        let mut report = CleanupReport {
            dry_run,
            expired_tasks: expired.len(),
            sample_task_ids: expired.iter().take(self.samples).map(|t| t.id).collect(),
            owned_urls: owned.len(),
            foreign_urls: foreign.len(),
            ..CleanupReport::default()
        };

        let sizes = self.sizes(&owned).await;
        report.owned_bytes = sizes.values().sum();
        report.unsized_urls = owned.len() - sizes.len();

        if dry_run || expired.is_empty() {
            info!(dry_run, expired = report.expired_tasks, urls = report.owned_urls, "cleanup selection");
            return Ok(report);
        }

        report.blobs = self.deleter.delete_all(self.blobs.as_ref(), &owned).await;
        report.bytes_freed = sizes
            .iter()
            .filter(|(url, _)| !report.blobs.failed_urls.contains(*url))
            .map(|(_, size)| size)
            .sum();

        let ids: Vec<TaskId> = expired.iter().map(|t| t.id).collect();
        match self.records.delete_tasks(&ids).await {
            Ok(n) => report.records_deleted = n,
            Err(e) => error!(error = %e, tasks = ids.len(), "could not delete expired task records"),
        }

        info!(
            expired = report.expired_tasks,
            blobs_deleted = report.blobs.deleted,
            failed_batches = report.blobs.failed_batches,
            bytes_freed = report.bytes_freed,
            records_deleted = report.records_deleted,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Sizes of the given URLs that still exist in the object store.
    async fn sizes(&self, urls: &[String]) -> HashMap<String, u64> {
        let mut sizes = HashMap::with_capacity(urls.len());
        for url in urls {
            match self.blobs.head(url).await {
                Ok(Some(blob)) => {
                    sizes.insert(url.clone(), blob.size);
                }
                Ok(None) => {}
                Err(e) => warn!(%url, error = %e, "could not read payload size"),
            }
        }
        sizes
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "Expired task cleanup{mode}")?;
        writeln!(f, "  expired tasks:   {}", self.expired_tasks)?;
        for id in &self.sample_task_ids {
            writeln!(f, "    {id}")?;
        }
        writeln!(f, "  payload urls:    {} ({} external, kept)", self.owned_urls, self.foreign_urls)?;
        writeln!(
            f,
            "  payload size:    {} ({} unknown)",
            super::human_bytes(self.owned_bytes),
            self.unsized_urls
        )?;
        if self.dry_run {
            return write!(f, "  no changes written");
        }
        writeln!(
            f,
            "  blobs deleted:   {} in {} batches ({} failed)",
            self.blobs.deleted, self.blobs.batches, self.blobs.failed_batches
        )?;
        writeln!(f, "  bytes freed:     {}", super::human_bytes(self.bytes_freed))?;
        write!(f, "  records deleted: {}", self.records_deleted)
    }
}
