use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::content::{ContentStore, LocalContentStore};
use super::metadata::{BackupFileInfo, BackupMetadata, MetadataIndex};
use crate::atomic::{file_mode, write_atomic_with_mode};
use crate::error::PatchError;
use crate::integrity::Integrity;
use crate::queue::OperationQueue;

/// Outcome of restoring every file of one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl RestoreReport {
    pub fn total(&self) -> usize {
        self.restored.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} files restored", self.restored.len(), self.total())?;
        if !self.failed.is_empty() {
            let failures: Vec<String> = self
                .failed
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            write!(f, "; failures: {}", failures.join(", "))?;
        }
        Ok(())
    }
}

/// Result of checking one backup against the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupVerification {
    /// Content present and hashes to the recorded integrity.
    Intact,
    /// Metadata exists but the content store no longer has the bytes.
    MissingContent,
    /// Stored bytes no longer match the recorded integrity.
    Corrupted { actual: String },
    /// No backup recorded for this (uuid, path).
    NotFound,
}

/// Content-addressed backups of files touched by a patch.
///
/// Layout under the cache root:
/// ```text
/// {root}/
///   content-v1/   blobs keyed by integrity (see LocalContentStore)
///   index-v1/     one metadata record per patch UUID
/// ```
///
/// Metadata read-modify-write is serialized per UUID through the shared
/// [`OperationQueue`]. Storing a blob and recording it happen under a shared
/// guard that cleanup takes exclusively, so cleanup never sees a blob that is
/// stored but not yet referenced.
#[derive(Debug, Clone)]
pub struct BackupStore {
    content: Arc<dyn ContentStore>,
    index: MetadataIndex,
    queue: Arc<OperationQueue>,
    gc: Arc<RwLock<()>>,
}

impl BackupStore {
    /// Backups on the local filesystem under `root`.
    pub fn new(root: impl AsRef<Path>, queue: Arc<OperationQueue>) -> Self {
        let root = root.as_ref();
        let content = Arc::new(LocalContentStore::new(root.join("content-v1")));
        Self::with_content_store(root, content, queue)
    }

    /// Backups whose blobs live in `content`; metadata stays under `root`.
    pub fn with_content_store(
        root: impl AsRef<Path>,
        content: Arc<dyn ContentStore>,
        queue: Arc<OperationQueue>,
    ) -> Self {
        Self {
            content,
            index: MetadataIndex::new(root.as_ref().join("index-v1")),
            queue,
            gc: Arc::new(RwLock::new(())),
        }
    }

    pub fn content_store(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    fn queue_key(uuid: &str) -> String {
        format!("backup:{}", uuid)
    }

    /// Snapshot `path` under `uuid`.
    ///
    /// If the pair already has a backup the existing snapshot is kept and
    /// returned, so a second call after the file was patched cannot replace
    /// the pristine bytes.
    #[instrument(skip(self), level = "debug")]
    pub async fn create_backup(
        &self,
        uuid: &str,
        path: &Path,
    ) -> Result<BackupFileInfo, PatchError> {
        let path = absolute(path)?;

        if let Some(existing) = self.get_backup_info(uuid, &path).await? {
            debug!("Backup of {} already recorded for {}", path.display(), uuid);
            return Ok(existing);
        }

        let data = fs::read(&path).await.map_err(|e| {
            PatchError::Io(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mode = fs::metadata(&path)
            .await
            .ok()
            .and_then(|metadata| file_mode(&metadata));
        let size = data.len() as u64;

        let _gc = self.gc.read().await;
        let integrity = self.content.put(data).await?;

        let info = BackupFileInfo {
            integrity,
            size,
            original_path: path,
            backed_up_at: Utc::now(),
            mode,
        };

        let index = self.index.clone();
        let uuid = uuid.to_string();
        self.queue
            .run(Self::queue_key(&uuid), move || async move {
                let mut metadata = index
                    .load(&uuid)
                    .await?
                    .unwrap_or_else(|| BackupMetadata::new(uuid.clone()));
                let recorded = metadata.insert_if_absent(info).clone();
                index.save(&metadata).await?;
                debug!(
                    "Backed up {} as {} for {}",
                    recorded.original_path.display(),
                    recorded.integrity,
                    uuid
                );
                Ok(recorded)
            })
            .await
    }

    /// Snapshot several files concurrently.
    pub async fn create_backups(
        &self,
        uuid: &str,
        paths: &[PathBuf],
    ) -> Result<Vec<BackupFileInfo>, PatchError> {
        try_join_all(paths.iter().map(|path| self.create_backup(uuid, path))).await
    }

    /// Restore `path` from its backup under `uuid`.
    ///
    /// Returns `false` instead of failing when there is no backup, when the
    /// content is gone or fails verification, or when the write fails.
    #[instrument(skip(self), level = "debug")]
    pub async fn restore_backup(&self, uuid: &str, path: &Path) -> bool {
        match self.try_restore(uuid, path).await {
            Ok(restored) => restored,
            Err(e) => {
                warn!("Failed to restore {} for {}: {}", path.display(), uuid, e);
                false
            }
        }
    }

    async fn try_restore(&self, uuid: &str, path: &Path) -> Result<bool, PatchError> {
        let Some(info) = self.get_backup_info(uuid, path).await? else {
            debug!("No backup of {} for {}", path.display(), uuid);
            return Ok(false);
        };

        let Some(data) = self.content.get(&info.integrity).await? else {
            warn!(
                "Backup content {} for {} is missing from the content store",
                info.integrity,
                info.original_path.display()
            );
            return Ok(false);
        };

        write_atomic_with_mode(&info.original_path, &data, info.mode).await?;
        debug!(
            "Restored {} ({} bytes) for {}",
            info.original_path.display(),
            data.len(),
            uuid
        );
        Ok(true)
    }

    /// Restore every file recorded for `uuid`, reporting per-file results.
    #[instrument(skip(self), level = "debug")]
    pub async fn restore_all_backups(&self, uuid: &str) -> RestoreReport {
        let mut report = RestoreReport::default();

        let paths = match self.list_backups(uuid).await {
            Ok(Some(paths)) => paths,
            Ok(None) => return report,
            Err(e) => {
                warn!("Failed to read backups for {}: {}", uuid, e);
                return report;
            }
        };

        for path in paths {
            if self.restore_backup(uuid, &path).await {
                report.restored.push(path);
            } else {
                report.failed.push(path);
            }
        }

        debug!("Restore of {}: {}", uuid, report);
        report
    }

    /// Original paths backed up for `uuid`; `None` when the UUID is unknown.
    pub async fn list_backups(&self, uuid: &str) -> Result<Option<Vec<PathBuf>>, PatchError> {
        Ok(self
            .index
            .load(uuid)
            .await?
            .map(|metadata| metadata.original_paths()))
    }

    pub async fn get_backup_info(
        &self,
        uuid: &str,
        path: &Path,
    ) -> Result<Option<BackupFileInfo>, PatchError> {
        let path = absolute(path)?;
        Ok(self
            .index
            .load(uuid)
            .await?
            .and_then(|metadata| metadata.file(&path).cloned()))
    }

    pub async fn get_patch_metadata(
        &self,
        uuid: &str,
    ) -> Result<Option<BackupMetadata>, PatchError> {
        self.index.load(uuid).await
    }

    pub async fn has_backup(&self, uuid: &str, path: &Path) -> Result<bool, PatchError> {
        Ok(self.get_backup_info(uuid, path).await?.is_some())
    }

    /// Check a backup's content against its recorded integrity. Detection
    /// only; nothing is repaired.
    pub async fn verify_backup(
        &self,
        uuid: &str,
        path: &Path,
    ) -> Result<BackupVerification, PatchError> {
        let Some(info) = self.get_backup_info(uuid, path).await? else {
            return Ok(BackupVerification::NotFound);
        };

        match self.content.get(&info.integrity).await {
            Ok(Some(_)) => Ok(BackupVerification::Intact),
            Ok(None) => Ok(BackupVerification::MissingContent),
            Err(PatchError::IntegrityMismatch { actual, .. }) => {
                Ok(BackupVerification::Corrupted { actual })
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the metadata for `uuid` and every blob it references that no
    /// other patch still references. Returns `false` when there was nothing
    /// to delete.
    #[instrument(skip(self), level = "debug")]
    pub async fn cleanup_backups(&self, uuid: &str) -> Result<bool, PatchError> {
        let _gc = self.gc.write().await;
        let index = self.index.clone();
        let content = Arc::clone(&self.content);
        let uuid = uuid.to_string();

        self.queue
            .run(Self::queue_key(&uuid), move || async move {
                let Some(metadata) = index.load(&uuid).await? else {
                    debug!("No backups recorded for {}", uuid);
                    return Ok(false);
                };

                index.delete(&uuid).await?;

                let others = index.load_all().await?;
                let blobs: HashSet<&Integrity> =
                    metadata.files.values().map(|info| &info.integrity).collect();

                let mut removed = 0usize;
                for integrity in blobs {
                    if others.iter().any(|other| other.references(integrity)) {
                        continue;
                    }
                    match content.remove(integrity).await {
                        Ok(true) => removed += 1,
                        Ok(false) => {}
                        Err(e) => warn!("Failed to remove content {}: {}", integrity, e),
                    }
                }

                debug!(
                    "Cleaned up backups for {} ({} files, {} blobs removed)",
                    uuid,
                    metadata.files.len(),
                    removed
                );
                Ok(true)
            })
            .await
    }

    /// Every UUID that has backup metadata.
    pub async fn list_all_patches(&self) -> Result<Vec<String>, PatchError> {
        Ok(self
            .index
            .load_all()
            .await?
            .into_iter()
            .map(|metadata| metadata.uuid)
            .collect())
    }
}

pub(crate) fn absolute(path: &Path) -> Result<PathBuf, PatchError> {
    std::path::absolute(path)
        .map_err(|e| PatchError::Io(format!("Failed to resolve {}: {}", path.display(), e)))
}
