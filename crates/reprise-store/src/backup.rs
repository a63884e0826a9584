//! Snapshots of the store file, with retention and restore.
//!
//! A snapshot is a byte-for-byte copy of the primary file named
//! `database-backup-<timestamp>-<tag>.json`, where the timestamp is ISO 8601
//! with `:` and `.` replaced by `-`. Snapshot, restore and recovery all
//! run under [`FilterStore::exclusive`], so none of them can interleave
//! with a mutation or a store write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use reprise_shared::constants::{BACKUP_EXTENSION, BACKUP_PREFIX};

use crate::error::{Result, StoreError};
use crate::models::StoreDocument;
use crate::store::{write_atomic, FilterStore};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3f";

pub const TAG_AUTO: &str = "auto";
pub const TAG_MANUAL: &str = "manual";
pub const TAG_BEFORE_RESTORE: &str = "before-restore";
pub const TAG_SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSnapshot {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub tag: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub count: usize,
    pub total_bytes: u64,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub attempted: bool,
    pub succeeded: bool,
    /// Snapshot the store was restored from.
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub async fn new(backup_dir: impl Into<PathBuf>, max_backups: usize) -> Result<Self> {
        let backup_dir = backup_dir.into();
        fs::create_dir_all(&backup_dir).await?;
        info!(path = %backup_dir.display(), max_backups, "Backup manager initialized");
        Ok(Self {
            backup_dir,
            max_backups: max_backups.max(1),
        })
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy the current store file into the backup directory.
    ///
    /// Returns `Ok(None)` when there is no store file yet.
    pub async fn snapshot(&self, store: &FilterStore, tag: &str) -> Result<Option<PathBuf>> {
        let guard = store.exclusive().await;
        self.snapshot_file(guard.path(), tag).await
    }

    async fn snapshot_file(&self, primary: &Path, tag: &str) -> Result<Option<PathBuf>> {
        if !fs::try_exists(primary).await.unwrap_or(false) {
            warn!(path = %primary.display(), "Store file not found, skipping backup");
            return Ok(None);
        }

        let name = snapshot_name(Utc::now(), tag);
        let path = self.backup_dir.join(&name);
        fs::copy(primary, &path).await?;

        if let Err(e) = self.enforce_retention().await {
            warn!(error = %e, "Failed to prune old backups");
        }

        info!(name = %name, "Backup created");
        Ok(Some(path))
    }

    /// All snapshots, newest first.
    pub async fn list(&self) -> Result<Vec<BackupSnapshot>> {
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_snapshot_name(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }

            let (created_at, tag) = match parse_snapshot_name(&name) {
                Some(parsed) => parsed,
                None => {
                    let modified = meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    (modified, "unknown".to_string())
                }
            };

            snapshots.push(BackupSnapshot {
                path: entry.path(),
                name,
                created_at,
                tag,
                size: meta.len(),
            });
        }

        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(snapshots)
    }

    /// Look up a snapshot by file name. Only names that `list` returns
    /// resolve, so arbitrary paths cannot be smuggled in.
    pub async fn find(&self, name: &str) -> Result<Option<BackupSnapshot>> {
        Ok(self.list().await?.into_iter().find(|s| s.name == name))
    }

    /// Replace the store file with `snapshot` and reload the store.
    ///
    /// The candidate is fully parsed first and the current file is saved
    /// as a `before-restore` snapshot. Any failure before the final rename
    /// leaves the store file untouched.
    pub async fn restore(&self, store: &FilterStore, snapshot: &Path) -> Result<()> {
        let bytes = read_valid_backup(snapshot).await?;

        let mut guard = store.exclusive().await;
        if let Some(saved) = self.snapshot_file(guard.path(), TAG_BEFORE_RESTORE).await? {
            debug!(path = %saved.display(), "Current store saved before restore");
        }

        write_atomic(guard.path(), &bytes)
            .await
            .map_err(|e| StoreError::Restore(e.to_string()))?;
        guard.reload().await?;

        info!(from = %snapshot.display(), "Store restored from backup");
        Ok(())
    }

    /// Startup recovery: when the store file is missing or unparseable,
    /// restore the newest snapshot that restores cleanly.
    pub async fn auto_recover(&self, store: &FilterStore) -> Result<RecoveryReport> {
        if primary_is_healthy(store.path()).await {
            return Ok(RecoveryReport::default());
        }

        let snapshots = self.list().await?;
        if snapshots.is_empty() {
            info!("No backups available for recovery");
            return Ok(RecoveryReport::default());
        }

        for snapshot in &snapshots {
            info!(name = %snapshot.name, "Attempting recovery from backup");
            match self.restore(store, &snapshot.path).await {
                Ok(()) => {
                    info!(name = %snapshot.name, "Recovery succeeded");
                    return Ok(RecoveryReport {
                        attempted: true,
                        succeeded: true,
                        source: Some(snapshot.path.clone()),
                    });
                }
                Err(e) => warn!(name = %snapshot.name, error = %e, "Backup unusable, trying older"),
            }
        }

        warn!("Recovery failed, no usable backup");
        Ok(RecoveryReport {
            attempted: true,
            succeeded: false,
            source: None,
        })
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        let snapshots = self.list().await?;
        Ok(BackupStats {
            count: snapshots.len(),
            total_bytes: snapshots.iter().map(|s| s.size).sum(),
            newest: snapshots.first().map(|s| s.created_at),
            oldest: snapshots.last().map(|s| s.created_at),
        })
    }

    /// Delete all but the newest `max_backups` snapshots.
    async fn enforce_retention(&self) -> Result<usize> {
        let snapshots = self.list().await?;
        let mut removed = 0;
        for old in snapshots.iter().skip(self.max_backups) {
            match fs::remove_file(&old.path).await {
                Ok(()) => {
                    debug!(name = %old.name, "Removed old backup");
                    removed += 1;
                }
                Err(e) => warn!(name = %old.name, error = %e, "Failed to remove old backup"),
            }
        }
        Ok(removed)
    }
}

fn snapshot_name(at: DateTime<Utc>, tag: &str) -> String {
    let tag: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!(
        "{BACKUP_PREFIX}-{}Z-{tag}.{BACKUP_EXTENSION}",
        at.format(TIMESTAMP_FORMAT)
    )
}

fn is_snapshot_name(name: &str) -> bool {
    name.starts_with(&format!("{BACKUP_PREFIX}-"))
        && name.ends_with(&format!(".{BACKUP_EXTENSION}"))
}

/// Split a snapshot file name into its timestamp and tag.
fn parse_snapshot_name(name: &str) -> Option<(DateTime<Utc>, String)> {
    let body = name
        .strip_prefix(BACKUP_PREFIX)?
        .strip_prefix('-')?
        .strip_suffix(BACKUP_EXTENSION)?
        .strip_suffix('.')?;
    let (stamp, tag) = body.split_once("Z-")?;
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((naive.and_utc(), tag.to_string()))
}

/// Read a backup and check that it is a usable store document.
async fn read_valid_backup(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| StoreError::Restore(format!("cannot read {}: {e}", path.display())))?;

    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| StoreError::Restore(format!("{} is not valid JSON: {e}", path.display())))?;
    let known_fields = value
        .as_object()
        .map(|obj| obj.contains_key("filters") || obj.contains_key("media"))
        .unwrap_or(false);
    if !known_fields {
        return Err(StoreError::Restore(format!(
            "{} has neither filters nor media",
            path.display()
        )));
    }

    let doc = serde_json::from_value::<StoreDocument>(value)
        .map_err(|e| StoreError::Restore(format!("{} has an invalid structure: {e}", path.display())))?;
    doc.validate()
        .map_err(|e| StoreError::Restore(format!("{} fails validation: {e}", path.display())))?;
    Ok(bytes)
}

async fn primary_is_healthy(path: &Path) -> bool {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice::<StoreDocument>(&bytes)
            .is_ok_and(|doc| doc.validate().is_ok()),
        Err(_) => false,
    }
}
