use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backup::{absolute, BackupStore, RestoreReport};
use crate::error::PatchError;
use crate::lock::{LockManager, LockOptions};
use crate::manifest::{ManifestStore, PatchRecord, PatchStatus, SOCKET_DIR};
use crate::queue::OperationQueue;

/// Lock guarding every mutating workflow on one project.
pub fn patches_lock_path(cwd: &Path) -> PathBuf {
    cwd.join(SOCKET_DIR).join("_patches").join(".lock")
}

/// Rollback result for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRollback {
    pub package_id: String,
    pub uuid: String,
    pub report: RestoreReport,
}

impl PatchRollback {
    pub fn is_complete(&self) -> bool {
        self.report.is_complete()
    }
}

impl fmt::Display for PatchRollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.package_id, self.report)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The project has no manifest.
    NoManifest,
    /// One entry per patch that was rolled back (or attempted).
    RolledBack(Vec<PatchRollback>),
}

impl RollbackOutcome {
    pub fn is_complete(&self) -> bool {
        match self {
            RollbackOutcome::NoManifest => true,
            RollbackOutcome::RolledBack(patches) => patches.iter().all(|p| p.is_complete()),
        }
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackOutcome::NoManifest => write!(f, "no manifest found, nothing to roll back"),
            RollbackOutcome::RolledBack(patches) if patches.is_empty() => {
                write!(f, "no applied patches, nothing to roll back")
            }
            RollbackOutcome::RolledBack(patches) => {
                for (i, patch) in patches.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", patch)?;
                }
                Ok(())
            }
        }
    }
}

/// One line of [`PatchEngine::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub package_id: String,
    pub uuid: String,
    pub status: PatchStatus,
    pub patched_files: usize,
    pub backed_up_files: usize,
}

/// Apply, roll back and inspect patches on a project.
///
/// Mutating workflows hold the project lock for their whole duration, so two
/// processes never interleave on the same `.socket` directory. Within one
/// process the manifest and backup stores additionally serialize their own
/// read-modify-write cycles through a shared [`OperationQueue`].
#[derive(Debug, Clone)]
pub struct PatchEngine {
    locks: Arc<LockManager>,
    manifests: ManifestStore,
    backups: BackupStore,
    lock_options: LockOptions,
}

impl PatchEngine {
    /// Engine with backups under `cache_dir` on the local filesystem.
    pub fn new(cache_dir: impl AsRef<Path>, lock_options: LockOptions) -> Self {
        let queue = Arc::new(OperationQueue::new());
        Self::from_parts(
            Arc::new(LockManager::new()),
            ManifestStore::new(Arc::clone(&queue)),
            BackupStore::new(cache_dir, queue),
            lock_options,
        )
    }

    pub fn from_parts(
        locks: Arc<LockManager>,
        manifests: ManifestStore,
        backups: BackupStore,
        lock_options: LockOptions,
    ) -> Self {
        Self {
            locks,
            manifests,
            backups,
            lock_options,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Record `record` for `package_id`, snapshot `files`, then run `edit`.
    ///
    /// Relative entries in `files` are resolved against `cwd`. The record
    /// ends up `applied` when the edit succeeds and `failed` otherwise; the
    /// edit's error is returned unchanged. Backups are kept either way so a
    /// half-applied edit can still be rolled back.
    ///
    /// A package that already has an applied or failed patch is rolled back
    /// first, so the new backups capture the original bytes. If that rollback
    /// is partial nothing is applied and
    /// [`PatchError::RollbackIncomplete`] is returned.
    #[instrument(skip(self, record, files, edit), level = "debug", fields(uuid = %record.uuid))]
    pub async fn apply_patch<F, Fut>(
        &self,
        cwd: &Path,
        package_id: &str,
        mut record: PatchRecord,
        files: &[PathBuf],
        edit: F,
    ) -> Result<PatchRecord, PatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), PatchError>>,
    {
        let targets = files
            .iter()
            .map(|file| absolute(&cwd.join(file)))
            .collect::<Result<Vec<_>, _>>()?;
        let uuid = record.uuid.clone();
        record.status = PatchStatus::Downloaded;

        self.locks
            .with_lock(patches_lock_path(cwd), &self.lock_options, || async {
                if let Some(existing) = self.manifests.get_patch(cwd, package_id).await? {
                    if existing.status != PatchStatus::Downloaded {
                        let previous = self
                            .rollback_one(cwd, package_id.to_string(), existing)
                            .await?;
                        if !previous.is_complete() {
                            return Err(PatchError::RollbackIncomplete {
                                package_id: package_id.to_string(),
                                report: previous.report.to_string(),
                            });
                        }
                        debug!("Rolled back {} before re-applying", package_id);
                    }
                }

                self.manifests.add_patch(cwd, package_id, record).await?;

                if let Err(e) = self.backups.create_backups(&uuid, &targets).await {
                    warn!("Backup for {} failed, not applying: {}", package_id, e);
                    self.manifests
                        .update_patch_status(cwd, package_id, PatchStatus::Failed, None)
                        .await?;
                    return Err(e);
                }

                match edit().await {
                    Ok(()) => {
                        let applied = self
                            .manifests
                            .update_patch_status(
                                cwd,
                                package_id,
                                PatchStatus::Applied,
                                Some(targets.clone()),
                            )
                            .await?;
                        info!("Applied patch {} to {}", uuid, package_id);
                        Ok(applied)
                    }
                    Err(e) => {
                        warn!("Patch {} for {} failed: {}", uuid, package_id, e);
                        self.manifests
                            .update_patch_status(
                                cwd,
                                package_id,
                                PatchStatus::Failed,
                                Some(targets.clone()),
                            )
                            .await?;
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Restore the files of every applied or failed patch, or only of
    /// `package_id` when given.
    ///
    /// A patch whose files all come back is dropped from the manifest and its
    /// backups are cleaned up. A partial restore leaves both in place so the
    /// rollback can be retried. A file listed in the record's `appliedTo`
    /// with no backup to restore from counts as a failure.
    #[instrument(skip(self), level = "debug")]
    pub async fn rollback(
        &self,
        cwd: &Path,
        package_id: Option<&str>,
    ) -> Result<RollbackOutcome, PatchError> {
        self.locks
            .with_lock(patches_lock_path(cwd), &self.lock_options, || async {
                if !self.manifests.manifest_exists(cwd).await {
                    debug!("No manifest in {}", cwd.display());
                    return Ok(RollbackOutcome::NoManifest);
                }

                let manifest = self.manifests.read_manifest(cwd).await?;
                let targets: Vec<(String, PatchRecord)> = match package_id {
                    Some(id) => {
                        let record = manifest
                            .get(id)
                            .cloned()
                            .ok_or_else(|| PatchError::PatchNotFound(id.to_string()))?;
                        vec![(id.to_string(), record)]
                    }
                    None => manifest
                        .patches
                        .into_iter()
                        .filter(|(_, record)| record.status != PatchStatus::Downloaded)
                        .collect(),
                };

                let mut results = Vec::with_capacity(targets.len());
                for (id, record) in targets {
                    results.push(self.rollback_one(cwd, id, record).await?);
                }
                Ok(RollbackOutcome::RolledBack(results))
            })
            .await
    }

    async fn rollback_one(
        &self,
        cwd: &Path,
        package_id: String,
        record: PatchRecord,
    ) -> Result<PatchRollback, PatchError> {
        let mut report = self.backups.restore_all_backups(&record.uuid).await;

        for path in record.applied_to.iter().flatten() {
            let path = absolute(&cwd.join(path))?;
            if !report.restored.contains(&path) && !report.failed.contains(&path) {
                warn!("No backup of {} for {}", path.display(), record.uuid);
                report.failed.push(path);
            }
        }

        if report.is_complete() {
            self.manifests.remove_patch(cwd, &package_id).await?;
            if let Err(e) = self.backups.cleanup_backups(&record.uuid).await {
                warn!("Failed to clean up backups for {}: {}", record.uuid, e);
            }
            info!("Rolled back {} ({})", package_id, report);
        } else {
            warn!("Partial rollback of {}: {}", package_id, report);
        }

        Ok(PatchRollback {
            package_id,
            uuid: record.uuid,
            report,
        })
    }

    /// Recorded patches and how many of their files have backups. Takes no
    /// lock.
    pub async fn status(&self, cwd: &Path) -> Result<Vec<PatchSummary>, PatchError> {
        let patches = self.manifests.get_all_patches(cwd).await?;

        let mut summaries = Vec::with_capacity(patches.len());
        for (package_id, record) in patches {
            let backed_up_files = self
                .backups
                .get_patch_metadata(&record.uuid)
                .await?
                .map(|metadata| metadata.files.len())
                .unwrap_or(0);
            summaries.push(PatchSummary {
                package_id,
                uuid: record.uuid,
                status: record.status,
                patched_files: record.files.len(),
                backed_up_files,
            });
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::Integrity;
    use crate::manifest::PatchFile;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        engine: PatchEngine,
        _cache: TempDir,
        project: TempDir,
    }

    fn fast_locks() -> LockOptions {
        LockOptions {
            retries: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            stale: Duration::from_secs(60),
        }
    }

    fn setup() -> Fixture {
        let cache = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let engine = PatchEngine::new(cache.path(), fast_locks());
        Fixture {
            engine,
            _cache: cache,
            project,
        }
    }

    fn record(uuid: &str) -> PatchRecord {
        let mut files = BTreeMap::new();
        files.insert(
            "package/index.js".to_string(),
            PatchFile {
                before_hash: Integrity::from_bytes(b"original"),
                after_hash: Integrity::from_bytes(b"patched"),
            },
        );
        PatchRecord::downloaded(uuid, files)
    }

    fn write_file(dir: &Path, rel: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn apply(fx: &Fixture, package_id: &str, uuid: &str, files: &[PathBuf]) {
        let targets = files.to_vec();
        fx.engine
            .apply_patch(fx.project.path(), package_id, record(uuid), files, || async move {
                for target in targets {
                    tokio::fs::write(&target, b"patched").await.unwrap();
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_then_rollback_restores_and_forgets() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");

        apply(&fx, "npm/a@1.0.0", "uuid-a", &[file.clone()]).await;
        assert_eq!(std::fs::read(&file).unwrap(), b"patched");

        let stored = fx.engine.manifests().get_patch(cwd, "npm/a@1.0.0").await.unwrap().unwrap();
        assert_eq!(stored.status, PatchStatus::Applied);
        assert_eq!(stored.applied_to, Some(vec![file.clone()]));
        assert!(!patches_lock_path(cwd).exists());

        let outcome = fx.engine.rollback(cwd, None).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(std::fs::read(&file).unwrap(), b"original");
        assert!(!fx.engine.manifests().has_patch(cwd, "npm/a@1.0.0").await.unwrap());
        assert!(fx.engine.backups().list_backups("uuid-a").await.unwrap().is_none());
        assert_eq!(outcome.to_string(), "npm/a@1.0.0: 1 of 1 files restored");
    }

    #[tokio::test]
    async fn test_relative_files_resolve_against_cwd() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/b/lib.js", b"original");

        let applied = fx
            .engine
            .apply_patch(
                cwd,
                "npm/b@1.0.0",
                record("uuid-b"),
                &[PathBuf::from("node_modules/b/lib.js")],
                || async { Ok(()) },
            )
            .await
            .unwrap();
        assert_eq!(applied.applied_to, Some(vec![file.clone()]));
        assert!(fx.engine.backups().has_backup("uuid-b", &file).await.unwrap());
    }

    #[tokio::test]
    async fn test_reapply_keeps_original_bytes() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");

        for (uuid, content) in [("uuid-1", &b"patched v1"[..]), ("uuid-2", &b"patched v2"[..])] {
            let target = file.clone();
            fx.engine
                .apply_patch(cwd, "npm/a@1.0.0", record(uuid), &[file.clone()], || async move {
                    tokio::fs::write(&target, content).await.unwrap();
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read(&file).unwrap(), b"patched v2");
        assert_eq!(
            fx.engine.backups().list_all_patches().await.unwrap(),
            vec!["uuid-2"]
        );

        let outcome = fx.engine.rollback(cwd, None).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(std::fs::read(&file).unwrap(), b"original");
        assert!(fx.engine.backups().list_all_patches().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reapply_refused_when_previous_cannot_be_restored() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");
        apply(&fx, "npm/a@1.0.0", "uuid-1", &[file.clone()]).await;

        let info = fx
            .engine
            .backups()
            .get_backup_info("uuid-1", &file)
            .await
            .unwrap()
            .unwrap();
        fx.engine
            .backups()
            .content_store()
            .remove(&info.integrity)
            .await
            .unwrap();

        let result = fx
            .engine
            .apply_patch(cwd, "npm/a@1.0.0", record("uuid-2"), &[file.clone()], || async {
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(PatchError::RollbackIncomplete { package_id, .. }) if package_id == "npm/a@1.0.0"
        ));

        let stored = fx.engine.manifests().get_patch(cwd, "npm/a@1.0.0").await.unwrap().unwrap();
        assert_eq!(stored.uuid, "uuid-1");
        assert!(!fx.engine.backups().has_backup("uuid-2", &file).await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_without_backups_keeps_record() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");
        apply(&fx, "npm/a@1.0.0", "uuid-a", &[file.clone()]).await;

        // Backups wiped out of band, e.g. a cleared cache.
        assert!(fx.engine.backups().cleanup_backups("uuid-a").await.unwrap());

        let outcome = fx.engine.rollback(cwd, None).await.unwrap();
        assert!(!outcome.is_complete());
        assert_eq!(
            outcome.to_string(),
            format!(
                "npm/a@1.0.0: 0 of 1 files restored; failures: {}",
                file.display()
            )
        );
        assert_eq!(std::fs::read(&file).unwrap(), b"patched");
        assert!(fx.engine.manifests().has_patch(cwd, "npm/a@1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_edit_marks_record_failed() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");

        let result = fx
            .engine
            .apply_patch(cwd, "npm/a@1.0.0", record("uuid-a"), &[file.clone()], || async {
                Err(PatchError::Internal("hash mismatch on target".to_string()))
            })
            .await;
        assert!(matches!(result, Err(PatchError::Internal(_))));

        let stored = fx.engine.manifests().get_patch(cwd, "npm/a@1.0.0").await.unwrap().unwrap();
        assert_eq!(stored.status, PatchStatus::Failed);
        assert!(fx.engine.backups().has_backup("uuid-a", &file).await.unwrap());
        assert!(fx.engine.lock_manager().held_locks().is_empty());
        assert!(!patches_lock_path(cwd).exists());
    }

    #[tokio::test]
    async fn test_missing_target_fails_before_edit() {
        let fx = setup();
        let cwd = fx.project.path();
        let missing = cwd.join("node_modules/ghost/index.js");
        let edited = AtomicBool::new(false);

        let result = fx
            .engine
            .apply_patch(cwd, "npm/ghost@1.0.0", record("uuid-g"), &[missing], || async {
                edited.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(PatchError::Io(_))));
        assert!(!edited.load(Ordering::SeqCst));

        let stored = fx.engine.manifests().get_patch(cwd, "npm/ghost@1.0.0").await.unwrap().unwrap();
        assert_eq!(stored.status, PatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_rollback_without_manifest() {
        let fx = setup();
        let outcome = fx.engine.rollback(fx.project.path(), None).await.unwrap();
        assert_eq!(outcome, RollbackOutcome::NoManifest);
        assert_eq!(outcome.to_string(), "no manifest found, nothing to roll back");

        let named = fx.engine.rollback(fx.project.path(), Some("npm/a@1.0.0")).await.unwrap();
        assert_eq!(named, RollbackOutcome::NoManifest);
    }

    #[tokio::test]
    async fn test_rollback_unknown_package() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");
        apply(&fx, "npm/a@1.0.0", "uuid-a", &[file]).await;

        let result = fx.engine.rollback(cwd, Some("npm/b@1.0.0")).await;
        assert!(matches!(result, Err(PatchError::PatchNotFound(id)) if id == "npm/b@1.0.0"));
        assert!(!patches_lock_path(cwd).exists());
    }

    #[tokio::test]
    async fn test_partial_rollback_keeps_state() {
        let fx = setup();
        let cwd = fx.project.path();
        let file_a = write_file(cwd, "node_modules/x/a.js", b"content a");
        let file_b = write_file(cwd, "node_modules/x/b.js", b"content b");
        apply(&fx, "npm/x@1.0.0", "uuid-x", &[file_a.clone(), file_b.clone()]).await;

        let info_b = fx
            .engine
            .backups()
            .get_backup_info("uuid-x", &file_b)
            .await
            .unwrap()
            .unwrap();
        fx.engine
            .backups()
            .content_store()
            .remove(&info_b.integrity)
            .await
            .unwrap();

        let outcome = fx.engine.rollback(cwd, Some("npm/x@1.0.0")).await.unwrap();
        assert!(!outcome.is_complete());
        assert_eq!(
            outcome.to_string(),
            format!(
                "npm/x@1.0.0: 1 of 2 files restored; failures: {}",
                file_b.display()
            )
        );

        assert_eq!(std::fs::read(&file_a).unwrap(), b"content a");
        assert_eq!(std::fs::read(&file_b).unwrap(), b"patched");
        assert!(fx.engine.manifests().has_patch(cwd, "npm/x@1.0.0").await.unwrap());
        assert!(fx.engine.backups().has_backup("uuid-x", &file_a).await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_skips_downloaded_patches() {
        let fx = setup();
        let cwd = fx.project.path();
        fx.engine
            .manifests()
            .add_patch(cwd, "npm/pending@1.0.0", record("uuid-p"))
            .await
            .unwrap();

        let outcome = fx.engine.rollback(cwd, None).await.unwrap();
        assert_eq!(outcome, RollbackOutcome::RolledBack(vec![]));
        assert_eq!(outcome.to_string(), "no applied patches, nothing to roll back");
        assert!(fx.engine.manifests().has_patch(cwd, "npm/pending@1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_held_project_lock_blocks_apply() {
        let fx = setup();
        let cwd = fx.project.path();
        let file = write_file(cwd, "node_modules/a/index.js", b"original");

        // Another process holding the project lock.
        let other = LockManager::new();
        other.acquire(patches_lock_path(cwd), &fast_locks()).await.unwrap();

        let result = fx
            .engine
            .apply_patch(cwd, "npm/a@1.0.0", record("uuid-a"), &[file.clone()], || async {
                Ok(())
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_lock_contention());
        assert!(!fx.engine.manifests().manifest_exists(cwd).await);

        other.release(patches_lock_path(cwd)).await.unwrap();
        apply(&fx, "npm/a@1.0.0", "uuid-a", &[file]).await;
    }

    #[tokio::test]
    async fn test_status_reports_backup_counts() {
        let fx = setup();
        let cwd = fx.project.path();
        assert!(fx.engine.status(cwd).await.unwrap().is_empty());

        let file_a = write_file(cwd, "node_modules/a/index.js", b"a");
        let file_b = write_file(cwd, "node_modules/a/util.js", b"b");
        apply(&fx, "npm/a@1.0.0", "uuid-a", &[file_a, file_b]).await;
        fx.engine
            .manifests()
            .add_patch(cwd, "npm/b@2.0.0", record("uuid-b"))
            .await
            .unwrap();

        let status = fx.engine.status(cwd).await.unwrap();
        assert_eq!(
            status,
            vec![
                PatchSummary {
                    package_id: "npm/a@1.0.0".to_string(),
                    uuid: "uuid-a".to_string(),
                    status: PatchStatus::Applied,
                    patched_files: 1,
                    backed_up_files: 2,
                },
                PatchSummary {
                    package_id: "npm/b@2.0.0".to_string(),
                    uuid: "uuid-b".to_string(),
                    status: PatchStatus::Downloaded,
                    patched_files: 1,
                    backed_up_files: 0,
                },
            ]
        );
    }
}
