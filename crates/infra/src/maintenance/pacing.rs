//! Paced, failure-isolated batch deletion against the object store.

use std::time::Duration;

use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::retry::RetryPolicy;

/// Longest wait after a run of failed batches, as a multiple of the base backoff.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Deletes URLs in fixed-size batches with a pause between batches.
///
/// A failed batch is logged and skipped. After failures the next batch waits
/// on an exponential backoff that restarts once a batch succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDeleter {
    pub batch_size: usize,
    pub delay: Duration,
    pub error_backoff: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batches: usize,
    pub attempted: usize,
    pub deleted: usize,
    pub failed_batches: usize,
    pub failed_urls: Vec<String>,
}

impl BatchDeleter {
    pub fn new(batch_size: usize, delay: Duration, error_backoff: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            delay,
            error_backoff: RetryPolicy::exponential(
                u32::MAX,
                error_backoff,
                error_backoff.saturating_mul(MAX_BACKOFF_FACTOR),
            ),
        }
    }

    pub async fn delete_all(&self, blobs: &dyn BlobStore, urls: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        let total = urls.len().div_ceil(self.batch_size);
        let mut consecutive_failures = 0;

        for (index, batch) in urls.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            report.attempted += batch.len();

            let pause = match blobs.delete_many(batch).await {
                Ok(()) => {
                    report.deleted += batch.len();
                    consecutive_failures = 0;
                    info!(batch = index + 1, of = total, size = batch.len(), "batch deleted");
                    self.delay
                }
                Err(e) => {
                    report.failed_batches += 1;
                    report.failed_urls.extend(batch.iter().cloned());
                    consecutive_failures += 1;
                    warn!(batch = index + 1, of = total, size = batch.len(), error = %e, "batch delete failed; continuing");
                    self.error_backoff.delay_for_attempt(consecutive_failures)
                }
            };

            if index + 1 < total {
                tokio::time::sleep(pause).await;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;

    async fn store_with(n: usize) -> (InMemoryBlobStore, Vec<String>) {
        let blobs = InMemoryBlobStore::new("https://blob.test");
        let mut urls = Vec::new();
        for i in 0..n {
            let stored = blobs.put(&format!("tryon/u/{i}.png"), vec![1], "image/png").await.unwrap();
            urls.push(stored.url);
        }
        (blobs, urls)
    }

    #[tokio::test(start_paused = true)]
    async fn splits_into_bounded_batches() {
        let (blobs, urls) = store_with(7).await;
        let deleter = BatchDeleter::new(3, Duration::from_secs(2), Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let report = deleter.delete_all(&blobs, &urls).await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.deleted, 7);
        assert_eq!(blobs.delete_calls(), 3);
        assert!(blobs.is_empty());
        // Two pauses, none after the last batch.
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_skipped_with_longer_backoff() {
        let (blobs, urls) = store_with(4).await;
        blobs.fail_next_deletes(1);
        let deleter = BatchDeleter::new(2, Duration::from_secs(2), Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let report = deleter.delete_all(&blobs, &urls).await;

        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.failed_urls, urls[..2].to_vec());
        assert_eq!(report.deleted, 2);
        assert_eq!(blobs.len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_back_off_exponentially() {
        let (blobs, urls) = store_with(8).await;
        blobs.fail_next_deletes(2);
        let deleter = BatchDeleter::new(2, Duration::from_secs(1), Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let report = deleter.delete_all(&blobs, &urls).await;

        assert_eq!(report.failed_batches, 2);
        assert_eq!(report.deleted, 4);
        // 5 s, then 10 s, then the regular 1 s once a batch succeeds.
        assert_eq!(started.elapsed(), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn nothing_to_delete_makes_no_calls() {
        let (blobs, _) = store_with(0).await;
        let report = BatchDeleter::new(50, Duration::ZERO, Duration::ZERO)
            .delete_all(&blobs, &[])
            .await;
        assert_eq!(report, BatchReport::default());
        assert_eq!(blobs.delete_calls(), 0);
    }
}
