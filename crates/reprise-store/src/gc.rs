//! Media garbage collection.
//!
//! Filters are the roots: a descriptor is live iff some filter's media list
//! names it. [`reconcile`] does a full mark-and-sweep over the store;
//! [`sweep_aged_files`] is an independent age-based pass over the media
//! directory that deletes old files whether or not anything references
//! them, including files no descriptor points at.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use reprise_shared::MediaDescriptor;

use crate::error::Result;
use crate::media::remove_file_best_effort;
use crate::models::StoreDocument;
use crate::store::FilterStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Descriptors dropped from the store.
    pub removed: usize,
    /// Backing files that existed and were deleted.
    pub files_deleted: usize,
}

/// Media ids referenced by at least one filter.
pub fn reachable_media(doc: &StoreDocument) -> HashSet<Uuid> {
    doc.filters
        .values()
        .flat_map(|filter| filter.media.iter().copied())
        .collect()
}

/// Drop every descriptor no filter references and delete its file.
///
/// The store is persisted only when something was removed, so a second
/// run with no intervening mutation is a no-op.
pub async fn reconcile(store: &FilterStore) -> Result<GcReport> {
    let garbage: Vec<MediaDescriptor> = store
        .transact(|doc| {
            let live = reachable_media(doc);
            let dead: Vec<Uuid> = doc
                .media
                .keys()
                .filter(|id| !live.contains(*id))
                .copied()
                .collect();
            let removed: Vec<MediaDescriptor> =
                dead.iter().filter_map(|id| doc.media.remove(id)).collect();
            let changed = !removed.is_empty();
            (removed, changed)
        })
        .await?;

    let mut report = GcReport {
        removed: garbage.len(),
        files_deleted: 0,
    };
    for descriptor in &garbage {
        if remove_file_best_effort(&descriptor.local_path).await {
            report.files_deleted += 1;
        }
    }

    if report.removed > 0 {
        info!(
            removed = report.removed,
            files_deleted = report.files_deleted,
            "Reconciled unreferenced media"
        );
    } else {
        debug!("Media reconcile found nothing to remove");
    }
    Ok(report)
}

/// Delete regular files in `media_dir` last modified more than `max_age`
/// ago, reachable or not. Descriptors whose file goes away this way become
/// invalid and are reported on replay.
pub async fn sweep_aged_files(media_dir: &Path, max_age: Duration) -> Result<usize> {
    let mut entries = match fs::read_dir(media_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut deleted = 0;
    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable media entry");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }

        let Ok(modified) = meta.modified() else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age && remove_file_best_effort(&entry.path()).await {
            deleted += 1;
        }
    }

    if deleted > 0 {
        info!(deleted, dir = %media_dir.display(), "Swept aged media files");
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use reprise_shared::{Filter, MediaKind};
    use tempfile::TempDir;

    use super::*;

    async fn write_descriptor(dir: &Path) -> MediaDescriptor {
        let id = Uuid::new_v4();
        let local_path = dir.join(format!("{id}.jpg"));
        fs::write(&local_path, b"jpeg").await.unwrap();
        MediaDescriptor {
            id,
            kind: MediaKind::Photo {
                width: Some(1),
                height: Some(1),
            },
            source: format!("photos/{id}.jpg"),
            local_path,
            file_name: format!("{id}.jpg"),
            original_name: "photo.jpg".into(),
            size: 4,
            mime_type: Some("image/jpeg".into()),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_removes_exactly_unreachable() {
        let dir = TempDir::new().unwrap();
        let (store, _) = FilterStore::open(dir.path().join("database.json")).await.unwrap();

        let kept = write_descriptor(dir.path()).await;
        let orphan = write_descriptor(dir.path()).await;
        let dropped = write_descriptor(dir.path()).await;

        let filter = Filter::new(String::new(), Vec::new(), vec![kept.id], None).unwrap();
        store
            .put_with_media("keep", filter, vec![kept.clone()])
            .await
            .unwrap();
        store.insert_media(orphan.clone()).await.unwrap();
        let other = Filter::new("x".into(), Vec::new(), vec![dropped.id], None).unwrap();
        store
            .put_with_media("gone", other, vec![dropped.clone()])
            .await
            .unwrap();
        store.delete("gone").await.unwrap();

        let report = reconcile(&store).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.files_deleted, 2);

        assert!(store.get_media(kept.id).await.is_some());
        assert!(kept.local_path.exists());
        assert!(store.get_media(orphan.id).await.is_none());
        assert!(!orphan.local_path.exists());
        assert!(!dropped.local_path.exists());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, _) = FilterStore::open(dir.path().join("database.json")).await.unwrap();
        store.insert_media(write_descriptor(dir.path()).await).await.unwrap();

        assert_eq!(reconcile(&store).await.unwrap().removed, 1);
        assert_eq!(reconcile(&store).await.unwrap(), GcReport::default());
    }

    #[tokio::test]
    async fn test_reconcile_tolerates_missing_files() {
        let dir = TempDir::new().unwrap();
        let (store, _) = FilterStore::open(dir.path().join("database.json")).await.unwrap();
        let descriptor = write_descriptor(dir.path()).await;
        fs::remove_file(&descriptor.local_path).await.unwrap();
        store.insert_media(descriptor).await.unwrap();

        let report = reconcile(&store).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.files_deleted, 0);
    }

    #[tokio::test]
    async fn test_sweep_aged_files() {
        let dir = TempDir::new().unwrap();
        let (store, _) = FilterStore::open(dir.path().join("database.json")).await.unwrap();
        let media_dir = dir.path().join("media");
        std::fs::create_dir(&media_dir).unwrap();

        let tracked = write_descriptor(&media_dir).await;
        let fresh_tracked = write_descriptor(&media_dir).await;
        let filter = Filter::new(
            String::new(),
            Vec::new(),
            vec![tracked.id, fresh_tracked.id],
            None,
        )
        .unwrap();
        store
            .put_with_media("tracked", filter, vec![tracked.clone(), fresh_tracked.clone()])
            .await
            .unwrap();

        let old = media_dir.join("old-untracked.bin");
        let fresh = media_dir.join("fresh.bin");
        std::fs::write(&old, b"old").unwrap();
        std::fs::write(&fresh, b"new").unwrap();
        std::fs::create_dir(media_dir.join("nested")).unwrap();

        let forty_days_ago = SystemTime::now() - Duration::from_secs(40 * 24 * 60 * 60);
        for path in [&old, &tracked.local_path] {
            std::fs::File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(forty_days_ago)
                .unwrap();
        }

        let thirty_days = Duration::from_secs(30 * 24 * 60 * 60);
        let deleted = sweep_aged_files(&media_dir, thirty_days).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(!old.exists());
        assert!(!tracked.local_path.exists());
        assert!(fresh.exists());
        assert!(fresh_tracked.local_path.exists());
        assert!(media_dir.join("nested").exists());

        // The descriptor stays; replay reports it as missing.
        assert!(store.get_media(tracked.id).await.is_some());

        assert_eq!(
            sweep_aged_files(&dir.path().join("missing"), thirty_days)
                .await
                .unwrap(),
            0
        );
    }
}
