//! Patch state and recovery for dependency source patches.
//!
//! This crate keeps the durable state behind applying and undoing patches:
//! - `ManifestStore`: per-project record of which patches are applied
//! - `BackupStore`: content-addressed snapshots of files before they are patched
//! - `LockManager`: cross-process lock over a project's patch state
//! - `OperationQueue`: in-process ordering of read-modify-write cycles per key
//! - `PatchEngine`: apply / rollback / status workflows built on the above

mod atomic;
mod backup;
mod engine;
mod error;
mod integrity;
mod lock;
mod manifest;
mod queue;

pub use backup::{
    BackupFileInfo, BackupMetadata, BackupStore, BackupVerification, ContentStore,
    LocalContentStore, RestoreReport,
};
pub use engine::{patches_lock_path, PatchEngine, PatchRollback, PatchSummary, RollbackOutcome};
pub use error::PatchError;
pub use integrity::{HashAlgorithm, Integrity};
pub use lock::{LockHandle, LockManager, LockOptions};
pub use manifest::{
    manifest_path, ManifestStore, PatchFile, PatchManifest, PatchRecord, PatchStatus,
    Vulnerability, CURRENT_MANIFEST_VERSION, MANIFEST_FILE, SOCKET_DIR,
};
pub use queue::OperationQueue;
