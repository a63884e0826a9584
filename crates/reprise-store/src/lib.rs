//! # reprise-store
//!
//! Durable storage for the filter bot: the JSON store document, the
//! [`FilterStore`] that serializes every mutation and write, timestamped
//! backups with restore and startup recovery, and media garbage collection.

pub mod backup;
pub mod gc;
pub mod media;
pub mod models;
pub mod store;

mod error;

pub use backup::{BackupManager, BackupSnapshot, BackupStats, RecoveryReport};
pub use error::{Result, StoreError};
pub use gc::GcReport;
pub use models::{FilterMap, StoreDocument, StoreStats};
pub use store::{FilterStore, LoadOutcome, StoreGuard, StoreSummary};
