#![forbid(unsafe_code)]

//! Maintenance pass over the on-disk caches. Meant to run from cron next to
//! the backend: drops cache entries no reader would accept any more and
//! deletes stale fallback snapshots.
//!
//! Safe while the backend is live: cache rewrites from both processes take
//! the same `cache.json.lock` flock, and every write goes through its own
//! temp file.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Parser;
use newtube_feed::{
    cache::{CacheStore, FallbackStore},
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    logging,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cache_maintenance", about = "Prune expired feed caches")]
struct MaintenanceArgs {
    /// Data directory holding cache.json and fallback/.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Alternate env file instead of the default one.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Delete fallback snapshots older than this many days.
    #[arg(long)]
    fallback_max_age_days: Option<u64>,

    /// Drop cache entries older than this many seconds. Defaults to the
    /// longest configured TTL.
    #[arg(long)]
    cache_max_age_secs: Option<u64>,

    /// Report what would be pruned without deleting anything.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct MaintenancePlan {
    cache_file: PathBuf,
    fallback_dir: PathBuf,
    cache_max_age: Duration,
    fallback_max_age: Duration,
}

/// Counts of what was pruned, or on a dry run what would be.
#[derive(Debug, Default, PartialEq)]
struct MaintenanceReport {
    cache_entries_pruned: usize,
    cache_entries_left: usize,
    snapshots_pruned: usize,
}

impl MaintenanceArgs {
    fn plan(&self, settings: &RuntimeSettings) -> Result<MaintenancePlan> {
        let cache_max_age = match self.cache_max_age_secs {
            Some(0) => bail!("--cache-max-age-secs must be positive"),
            Some(secs) => Duration::from_secs(secs),
            None => settings.feed_ttl.max(settings.metadata_ttl),
        };
        let fallback_max_age = match self.fallback_max_age_days {
            Some(0) => bail!("--fallback-max-age-days must be positive"),
            Some(days) => Duration::from_secs(days.saturating_mul(86_400)),
            None => settings.fallback_max_age,
        };
        Ok(MaintenancePlan {
            cache_file: settings.cache_file(),
            fallback_dir: settings.fallback_dir(),
            cache_max_age,
            fallback_max_age,
        })
    }
}

async fn run(plan: &MaintenancePlan, dry_run: bool) -> Result<MaintenanceReport> {
    let cache = CacheStore::new(&plan.cache_file);
    let fallback = FallbackStore::new(&plan.fallback_dir);

    if dry_run {
        let expired = cache.expired_count(plan.cache_max_age).await;
        return Ok(MaintenanceReport {
            cache_entries_pruned: expired,
            cache_entries_left: cache.len().await.saturating_sub(expired),
            snapshots_pruned: fallback.stale_files(plan.fallback_max_age).await.len(),
        });
    }

    let cache_entries_pruned = cache
        .prune(plan.cache_max_age)
        .await
        .with_context(|| format!("pruning {}", plan.cache_file.display()))?;
    let snapshots_pruned = fallback.cleanup(plan.fallback_max_age).await;
    Ok(MaintenanceReport {
        cache_entries_pruned,
        cache_entries_left: cache.len().await,
        snapshots_pruned,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MaintenanceArgs::parse();
    let settings = resolve_runtime_settings(RuntimeOverrides {
        data_root: args.data_root.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    logging::init(settings.log_format)?;

    let plan = args.plan(&settings)?;
    info!(
        cache = %plan.cache_file.display(),
        fallback = %plan.fallback_dir.display(),
        cache_max_age_secs = plan.cache_max_age.as_secs(),
        fallback_max_age_secs = plan.fallback_max_age.as_secs(),
        dry_run = args.dry_run,
        "starting cache maintenance"
    );

    let report = run(&plan, args.dry_run).await?;
    info!(
        dry_run = args.dry_run,
        cache_pruned = report.cache_entries_pruned,
        cache_left = report.cache_entries_left,
        snapshots_pruned = report.snapshots_pruned,
        "cache maintenance finished"
    );
    Ok(())
}
