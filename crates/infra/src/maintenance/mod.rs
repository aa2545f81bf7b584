//! Scheduled maintenance: retention backfill, expired-task cleanup, orphan
//! reconciliation and re-driving stale tasks.
//!
//! Every job is safe to run alongside live traffic and alongside the others.
//! Selection is re-evaluated on each run, so an interrupted run leaves its
//! remaining work to the next one.

pub mod backfill;
pub mod cleanup;
pub mod orphans;
pub mod pacing;
pub mod resume;

pub use backfill::{BackfillReport, RetentionBackfill};
pub use cleanup::{CleanupJob, CleanupReport};
pub use orphans::{OrphanReconciler, OrphanReport, OrphanScan};
pub use pacing::{BatchDeleter, BatchReport};
pub use resume::{ResumeReport, StaleTaskResumer};

/// `1536` -> `1.5 KiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for u in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = u;
    }
    format!("{value:.1} {unit}")
}

#[cfg(test)]
mod tests {
    use super::human_bytes;

    #[test]
    fn formats_sizes() {
        assert_eq!(human_bytes(10), "10 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
