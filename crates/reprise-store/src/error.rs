use std::path::PathBuf;

use thiserror::Error;

use reprise_shared::ValidationError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Generic I/O error (reading the store, listing directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be serialized or parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing or renaming the store file failed. The in-memory mutation
    /// that triggered the write is not durable.
    #[error("Failed to persist store to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A backup could not be restored. The primary file is untouched.
    #[error("Restore failed: {0}")]
    Restore(String),

    /// Input rejected by validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
