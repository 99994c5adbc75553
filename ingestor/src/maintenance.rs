use crate::db::Store;
use crate::metrics::CLEANUP_DELETED_TOTAL;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, error, info};

const MODULE: &str = "maintenance";
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Periodic retention cleanup and backups for one store.
pub struct Maintenance {
    pub cleanup_days: u32,
    pub cleanup_interval: Duration,
    pub backup_interval: Option<Duration>,
    pub backup_dir: PathBuf,
}

impl Maintenance {
    /// Runs forever: cleanup immediately and then every interval,
    /// backups after each backup interval.
    pub async fn run(self, store: Arc<Store>) {
        info!(
            "Starting maintenance with retention={} days, cleanup every {:?}, backup every {:?}",
            self.cleanup_days, self.cleanup_interval, self.backup_interval
        );

        let mut cleanup_ticker = interval(self.cleanup_interval.max(MIN_PERIOD));
        // Unused when backups are disabled.
        let backup_period = self
            .backup_interval
            .unwrap_or(self.cleanup_interval)
            .max(MIN_PERIOD);
        let mut backup_ticker = interval_at(Instant::now() + backup_period, backup_period);

        loop {
            tokio::select! {
                _ = cleanup_ticker.tick() => {
                    run_cleanup(&store, self.cleanup_days).await;
                }

                _ = backup_ticker.tick(), if self.backup_interval.is_some() => {
                    run_backup(&store, &self.backup_dir, Utc::now()).await;
                }
            }
        }
    }
}

pub(crate) async fn run_cleanup(store: &Store, days_to_keep: u32) -> Option<u64> {
    match store.cleanup_old_data(days_to_keep).await {
        Ok(deleted) => {
            CLEANUP_DELETED_TOTAL.inc_by(deleted as f64);
            if deleted > 0 {
                info!("Cleaned up {} readings older than {} days", deleted, days_to_keep);
            } else {
                debug!("Cleanup found no readings older than {} days", days_to_keep);
            }
            record(
                store,
                "INFO",
                &format!("Cleaned up {} readings older than {} days", deleted, days_to_keep),
            )
            .await;
            Some(deleted)
        }
        Err(e) => {
            error!("Cleanup failed: {}", e);
            record(store, "ERROR", &format!("Cleanup failed: {}", e)).await;
            None
        }
    }
}

pub(crate) async fn run_backup(
    store: &Store,
    backup_dir: &Path,
    now: DateTime<Utc>,
) -> Option<PathBuf> {
    let destination = backup_dir.join(backup_filename(now));

    match store.backup(&destination).await {
        Ok(()) => {
            info!("Database backed up to {}", destination.display());
            record(
                store,
                "INFO",
                &format!("Database backed up to {}", destination.display()),
            )
            .await;
            Some(destination)
        }
        Err(e) => {
            error!("Backup to {} failed: {}", destination.display(), e);
            record(store, "ERROR", &format!("Backup failed: {}", e)).await;
            None
        }
    }
}

fn backup_filename(now: DateTime<Utc>) -> String {
    format!("meter_data_{}.db", now.format("%Y%m%d_%H%M%S"))
}

async fn record(store: &Store, level: &str, message: &str) {
    if let Err(e) = store.log_system_event(level, message, Some(MODULE)).await {
        error!("Failed to record system event: {}", e);
    }
}
