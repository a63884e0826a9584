//! Filesystem helpers for downloaded media.

use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use reprise_shared::MediaDescriptor;

use crate::error::Result;

/// Whether a descriptor still matches its backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaValidity {
    Valid,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
}

impl MediaValidity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Check that `local_path` exists and has the recorded size.
///
/// Invalid descriptors are reported, never repaired; the filter has to be
/// re-added to fetch the media again.
pub async fn validate_descriptor(descriptor: &MediaDescriptor) -> MediaValidity {
    match fs::metadata(&descriptor.local_path).await {
        Ok(meta) if !meta.is_file() => MediaValidity::Missing,
        Ok(meta) if meta.len() != descriptor.size => {
            warn!(
                id = %descriptor.id,
                path = %descriptor.local_path.display(),
                expected = descriptor.size,
                actual = meta.len(),
                "Media file size mismatch"
            );
            MediaValidity::SizeMismatch {
                expected: descriptor.size,
                actual: meta.len(),
            }
        }
        Ok(_) => MediaValidity::Valid,
        Err(_) => {
            warn!(id = %descriptor.id, path = %descriptor.local_path.display(), "Missing media file");
            MediaValidity::Missing
        }
    }
}

/// Delete a file, treating "already gone" as success.
///
/// Returns `true` if a file was actually removed.
pub async fn remove_file_best_effort(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Deleted media file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Media file already gone");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete media file");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirUsage {
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Count regular files directly inside `dir`. A missing directory is empty.
pub async fn dir_usage(dir: &Path) -> Result<DirUsage> {
    let mut usage = DirUsage::default();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(usage),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            usage.file_count += 1;
            usage.total_bytes += meta.len();
        }
    }
    Ok(usage)
}
