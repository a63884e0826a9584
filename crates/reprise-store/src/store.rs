//! The filter store.
//!
//! [`FilterStore`] owns the in-memory [`StoreDocument`] and its on-disk
//! JSON file. Every read-modify-write runs under one async mutex, so a
//! "check keyword, mutate, persist" sequence can never interleave with
//! another. The serialized snapshot is captured under that lock; the file
//! write itself happens under a second, write-only lock and carries a
//! generation number so an older snapshot never lands on top of a newer
//! one.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use reprise_shared::{validate_keyword, Filter, MediaDescriptor, ValidationError};

use crate::error::{Result, StoreError};
use crate::models::StoreDocument;

/// What `open` found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The primary file parsed and was loaded.
    Loaded,
    /// No primary file existed; the store starts empty.
    Missing,
    /// The primary file was unparseable and moved to `aside`; the store
    /// starts empty.
    Corrupt { aside: PathBuf },
}

/// Live counters plus the size of the file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSummary {
    pub filters: usize,
    pub media: usize,
    pub file_kib: u64,
}

struct StoreState {
    doc: StoreDocument,
    generation: u64,
}

impl StoreState {
    /// Refresh stats, bump the generation and serialize.
    fn capture(&mut self) -> Result<(u64, Vec<u8>)> {
        self.doc.refresh_stats();
        self.generation += 1;
        let bytes = serde_json::to_vec_pretty(&self.doc)?;
        Ok((self.generation, bytes))
    }
}

pub struct FilterStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    /// Generation most recently written to `path`.
    written: Mutex<u64>,
}

impl FilterStore {
    /// Open the store at `path`, loading the file if it exists.
    ///
    /// A file that fails to parse is renamed to
    /// `<path>.corrupt.<timestamp>` and the store starts empty. Nothing is
    /// written here; callers decide whether to recover from a backup or to
    /// persist the empty document.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, LoadOutcome)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let (doc, outcome) = load_document(&path).await?;
        match &outcome {
            LoadOutcome::Loaded => info!(
                path = %path.display(),
                filters = doc.filters.len(),
                media = doc.media.len(),
                "Store loaded"
            ),
            LoadOutcome::Missing => info!(path = %path.display(), "No store file, starting empty"),
            LoadOutcome::Corrupt { aside } => warn!(
                path = %path.display(),
                aside = %aside.display(),
                "Store file corrupt, preserved aside and starting empty"
            ),
        }

        let store = Self {
            path,
            state: Mutex::new(StoreState { doc, generation: 0 }),
            written: Mutex::new(0),
        };
        Ok((store, outcome))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    pub async fn get(&self, keyword: &str) -> Option<Filter> {
        self.state.lock().await.doc.filters.get(keyword).cloned()
    }

    /// Filter plus its resolved descriptors, in filter order. References
    /// without a descriptor are skipped.
    pub async fn get_with_media(&self, keyword: &str) -> Option<(Filter, Vec<MediaDescriptor>)> {
        let state = self.state.lock().await;
        let filter = state.doc.filters.get(keyword)?.clone();
        let media = filter
            .media
            .iter()
            .filter_map(|id| state.doc.media.get(id).cloned())
            .collect();
        Some((filter, media))
    }

    /// Insert or fully replace a filter. Returns the previous value.
    pub async fn put(&self, keyword: &str, filter: Filter) -> Result<Option<Filter>> {
        self.put_with_media(keyword, filter, Vec::new()).await
    }

    /// Attach `descriptors` and store `filter` in one critical section.
    ///
    /// Every media id the filter references must be either already known
    /// or among `descriptors`.
    pub async fn put_with_media(
        &self,
        keyword: &str,
        filter: Filter,
        descriptors: Vec<MediaDescriptor>,
    ) -> Result<Option<Filter>> {
        validate_keyword(keyword)?;
        filter.validate()?;

        let (previous, generation, bytes) = {
            let mut state = self.state.lock().await;
            for id in &filter.media {
                let known = state.doc.media.contains_key(id)
                    || descriptors.iter().any(|d| d.id == *id);
                if !known {
                    return Err(ValidationError::UnknownMedia(*id).into());
                }
            }
            for descriptor in descriptors {
                state.doc.media.insert(descriptor.id, descriptor);
            }
            let previous = state.doc.filters.insert(keyword.to_string(), filter);
            let (generation, bytes) = state.capture()?;
            (previous, generation, bytes)
        };

        self.write_snapshot(generation, bytes).await?;
        debug!(keyword, replaced = previous.is_some(), "Filter stored");
        Ok(previous)
    }

    /// Remove a filter, leaving its media for the garbage collector.
    pub async fn delete(&self, keyword: &str) -> Result<Option<Filter>> {
        let (removed, snapshot) = {
            let mut state = self.state.lock().await;
            match state.doc.filters.remove(keyword) {
                Some(filter) => (Some(filter), Some(state.capture()?)),
                None => (None, None),
            }
        };

        if let Some((generation, bytes)) = snapshot {
            self.write_snapshot(generation, bytes).await?;
        }
        Ok(removed)
    }

    /// Remove a filter together with every descriptor it references that
    /// no remaining filter still references.
    ///
    /// Returns `None` if the keyword no longer exists. The caller owns
    /// deleting the returned descriptors' files.
    pub async fn take_filter(&self, keyword: &str) -> Result<Option<(Filter, Vec<MediaDescriptor>)>> {
        let (taken, generation, bytes) = {
            let mut state = self.state.lock().await;
            let Some(filter) = state.doc.filters.remove(keyword) else {
                return Ok(None);
            };

            let mut released = Vec::new();
            for id in &filter.media {
                let shared = state.doc.filters.values().any(|f| f.media.contains(id));
                if shared {
                    continue;
                }
                if let Some(descriptor) = state.doc.media.remove(id) {
                    released.push(descriptor);
                }
            }

            let (generation, bytes) = state.capture()?;
            ((filter, released), generation, bytes)
        };

        self.write_snapshot(generation, bytes).await?;
        Ok(Some(taken))
    }

    /// Keywords in insertion order.
    pub async fn list_keywords(&self) -> Vec<String> {
        self.state.lock().await.doc.filters.keywords().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Media
    // -----------------------------------------------------------------------

    pub async fn insert_media(&self, descriptor: MediaDescriptor) -> Result<()> {
        let (generation, bytes) = {
            let mut state = self.state.lock().await;
            state.doc.media.insert(descriptor.id, descriptor);
            state.capture()?
        };
        self.write_snapshot(generation, bytes).await
    }

    pub async fn get_media(&self, id: Uuid) -> Option<MediaDescriptor> {
        self.state.lock().await.doc.media.get(&id).cloned()
    }

    pub async fn list_media(&self) -> Vec<MediaDescriptor> {
        self.state.lock().await.doc.media.values().cloned().collect()
    }

    /// Drop a descriptor record. Only the record; the file stays on disk.
    pub async fn remove_media(&self, id: Uuid) -> Result<Option<MediaDescriptor>> {
        let (removed, snapshot) = {
            let mut state = self.state.lock().await;
            match state.doc.media.remove(&id) {
                Some(descriptor) => (Some(descriptor), Some(state.capture()?)),
                None => (None, None),
            }
        };

        if let Some((generation, bytes)) = snapshot {
            self.write_snapshot(generation, bytes).await?;
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Whole-document access
    // -----------------------------------------------------------------------

    /// Run `f` against the document under the store lock.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreDocument) -> R) -> R {
        f(&self.state.lock().await.doc)
    }

    /// Run `f` against the document under the store lock. When `f` reports
    /// the document as changed, the result is persisted before returning.
    pub async fn transact<R>(&self, f: impl FnOnce(&mut StoreDocument) -> (R, bool)) -> Result<R> {
        let (value, snapshot) = {
            let mut state = self.state.lock().await;
            let (value, changed) = f(&mut state.doc);
            let snapshot = if changed { Some(state.capture()?) } else { None };
            (value, snapshot)
        };

        if let Some((generation, bytes)) = snapshot {
            self.write_snapshot(generation, bytes).await?;
        }
        Ok(value)
    }

    /// Hold both the store lock and the file lock, for operations that copy
    /// or replace the file on disk.
    pub async fn exclusive(&self) -> StoreGuard<'_> {
        let state = self.state.lock().await;
        let written = self.written.lock().await;
        StoreGuard {
            path: &self.path,
            state,
            written,
        }
    }

    /// Serialize the current document and write it atomically.
    pub async fn persist(&self) -> Result<()> {
        let (generation, bytes) = self.state.lock().await.capture()?;
        self.write_snapshot(generation, bytes).await
    }

    /// Re-read the primary file. A corrupt file is moved aside and the
    /// store becomes empty, as on open.
    pub async fn reload(&self) -> Result<LoadOutcome> {
        self.exclusive().await.reload().await
    }

    pub async fn summary(&self) -> StoreSummary {
        let (filters, media) = {
            let state = self.state.lock().await;
            (state.doc.filters.len(), state.doc.media.len())
        };
        let file_kib = tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.len().div_ceil(1024))
            .unwrap_or(0);
        StoreSummary {
            filters,
            media,
            file_kib,
        }
    }

    async fn write_snapshot(&self, generation: u64, bytes: Vec<u8>) -> Result<()> {
        let mut written = self.written.lock().await;
        if *written >= generation {
            debug!(generation, latest = *written, "Skipping superseded store snapshot");
            return Ok(());
        }
        write_atomic(&self.path, &bytes).await?;
        *written = generation;
        Ok(())
    }
}

/// Exclusive access to the store and its file.
pub struct StoreGuard<'a> {
    path: &'a Path,
    state: MutexGuard<'a, StoreState>,
    written: MutexGuard<'a, u64>,
}

impl StoreGuard<'_> {
    pub fn path(&self) -> &Path {
        self.path
    }

    pub fn document(&self) -> &StoreDocument {
        &self.state.doc
    }

    /// Replace the in-memory document with whatever is now on disk.
    pub async fn reload(&mut self) -> Result<LoadOutcome> {
        let (doc, outcome) = load_document(self.path).await?;
        self.state.doc = doc;
        // Anything captured before the reload is stale.
        self.state.generation += 1;
        *self.written = self.state.generation;
        info!(
            path = %self.path.display(),
            filters = self.state.doc.filters.len(),
            media = self.state.doc.media.len(),
            ?outcome,
            "Store reloaded"
        );
        Ok(outcome)
    }

    /// Write the in-memory document while holding exclusive access.
    pub async fn persist(&mut self) -> Result<()> {
        let (generation, bytes) = self.state.capture()?;
        write_atomic(self.path, &bytes).await?;
        *self.written = generation;
        Ok(())
    }
}

async fn load_document(path: &Path) -> Result<(StoreDocument, LoadOutcome)> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((StoreDocument::default(), LoadOutcome::Missing));
        }
        Err(e) => return Err(e.into()),
    };

    let parsed = serde_json::from_slice::<StoreDocument>(&raw)
        .map_err(|e| e.to_string())
        .and_then(|doc| doc.validate().map(|()| doc).map_err(|e| e.to_string()));
    match parsed {
        Ok(mut doc) => {
            doc.stats.last_loaded = Some(Utc::now());
            Ok((doc, LoadOutcome::Loaded))
        }
        Err(reason) => {
            let aside = corrupt_path(path);
            tokio::fs::rename(path, &aside).await?;
            warn!(error = %reason, aside = %aside.display(), "Moved corrupt store file aside");
            Ok((StoreDocument::default(), LoadOutcome::Corrupt { aside }))
        }
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt.{stamp}"));
    PathBuf::from(name)
}

/// Write `bytes` to `<path>.tmp`, fsync, then rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let persist_err = |source| StoreError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::create(&tmp).await.map_err(persist_err)?;
    file.write_all(bytes).await.map_err(persist_err)?;
    file.sync_all().await.map_err(persist_err)?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persist_err(e));
    }
    Ok(())
}
