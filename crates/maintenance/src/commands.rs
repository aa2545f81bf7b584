use anyhow::{Context, bail};
use chrono::Utc;
use clap::Args;
use tracing::info;

use tryon_infra::bootstrap::Runtime;
use tryon_infra::config::AppConfig;
use tryon_infra::maintenance::{CleanupJob, OrphanReconciler, RetentionBackfill, StaleTaskResumer};

/// Upper bound on stale tasks re-driven per run.
const RESUME_LIMIT: usize = 100;

#[derive(Args, Debug)]
pub struct JobArgs {
    /// Report what would change without writing or deleting anything
    #[arg(long)]
    pub dry_run: bool,
}

async fn runtime() -> anyhow::Result<Runtime> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    connect(config).await
}

/// Jobs read and delete against the live stores, so an in-memory record
/// store is never acceptable here: its empty reference set would mark every
/// stored payload as an orphan.
async fn connect(config: AppConfig) -> anyhow::Result<Runtime> {
    if config.database_url.is_none() {
        bail!("DATABASE_URL must be set for maintenance jobs");
    }
    Runtime::from_config(config)
        .await
        .context("failed to connect to stores")
}

pub async fn backfill(args: JobArgs) -> anyhow::Result<String> {
    let rt = runtime().await?;
    info!(dry_run = args.dry_run, "starting retention backfill");
    let job = RetentionBackfill::new(rt.records.clone(), rt.config.maintenance.backfill_page_size);
    let report = job.run(Utc::now(), args.dry_run).await?;
    Ok(report.to_string())
}

pub async fn cleanup(args: JobArgs) -> anyhow::Result<String> {
    let rt = runtime().await?;
    info!(dry_run = args.dry_run, "starting expired task cleanup");
    let job = CleanupJob::new(
        rt.records.clone(),
        rt.blobs.clone(),
        rt.cleanup_deleter(),
        rt.config.maintenance.preview_samples,
    );
    let report = job.run(Utc::now(), args.dry_run).await?;
    Ok(report.to_string())
}

pub async fn orphans(args: JobArgs) -> anyhow::Result<String> {
    let rt = runtime().await?;
    info!(dry_run = args.dry_run, "starting orphan reconciliation");
    let m = &rt.config.maintenance;
    let min_age = chrono::Duration::from_std(m.min_orphan_age).context("orphan age out of range")?;
    let job = OrphanReconciler::new(
        rt.records.clone(),
        rt.blobs.clone(),
        rt.orphan_deleter(),
        m.managed_prefixes.clone(),
        m.list_page_size,
        min_age,
        m.preview_samples,
    );
    let report = job.run(Utc::now(), args.dry_run).await?;
    Ok(report.to_string())
}

pub async fn resume(args: JobArgs) -> anyhow::Result<String> {
    let rt = runtime().await?;
    info!(dry_run = args.dry_run, "starting stale task resume");
    let stale_after =
        chrono::Duration::from_std(rt.config.maintenance.stale_after).context("stale age out of range")?;
    let job = StaleTaskResumer::new(rt.service.clone(), stale_after, RESUME_LIMIT);
    let report = job.run(Utc::now(), args.dry_run).await?;
    Ok(report.to_string())
}
