//! Periodic maintenance loops.
//!
//! Each loop waits one full period before its first run, stops when the
//! shutdown token is cancelled and logs failures without exiting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use reprise_store::backup::TAG_AUTO;
use reprise_store::{gc, BackupManager, FilterStore};

use crate::rate_limit::RateGovernor;

/// Run `tick` every `period` until `shutdown` fires.
fn spawn_periodic<F, Fut>(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    name: &'static str,
    period: Duration,
    mut tick: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tracker.spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(job = name, period_secs = period.as_secs(), "Job started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(job = name, "Job stopped");
    });
}

pub fn spawn_backup_loop(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    store: Arc<FilterStore>,
    backups: Arc<BackupManager>,
    period: Duration,
) {
    spawn_periodic(tracker, shutdown, "backup", period, move || {
        let store = store.clone();
        let backups = backups.clone();
        async move {
            if let Err(e) = backups.snapshot(&store, TAG_AUTO).await {
                error!(error = %e, "Scheduled backup failed");
            }
        }
    });
}

/// Reconcile unreferenced media, then sweep aged files.
pub fn spawn_gc_loop(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    store: Arc<FilterStore>,
    media_dir: PathBuf,
    retention: Duration,
    period: Duration,
) {
    spawn_periodic(tracker, shutdown, "gc", period, move || {
        let store = store.clone();
        let media_dir = media_dir.clone();
        async move {
            match gc::reconcile(&store).await {
                Ok(report) if report.removed > 0 => info!(
                    removed = report.removed,
                    files_deleted = report.files_deleted,
                    "Scheduled media cleanup"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Scheduled media cleanup failed"),
            }
            match gc::sweep_aged_files(&media_dir, retention).await {
                Ok(0) => {}
                Ok(swept) => info!(swept, "Old media files deleted"),
                Err(e) => error!(error = %e, "Media sweep failed"),
            }
        }
    });
}

pub fn spawn_rate_sweep_loop(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    governor: RateGovernor,
    period: Duration,
) {
    spawn_periodic(tracker, shutdown, "rate-sweep", period, move || {
        let governor = governor.clone();
        async move {
            let evicted = governor.sweep();
            if evicted > 0 {
                debug!(evicted, "Expired rate windows evicted");
            }
        }
    });
}
