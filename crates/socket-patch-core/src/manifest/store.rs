use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, instrument, warn};

use super::schema::{PatchManifest, PatchRecord, PatchStatus};
use crate::atomic::write_atomic;
use crate::error::PatchError;
use crate::queue::OperationQueue;

/// Project-local state directory.
pub const SOCKET_DIR: &str = ".socket";

/// Manifest file name inside [`SOCKET_DIR`].
pub const MANIFEST_FILE: &str = "manifest.json";

/// Path of the manifest for the project rooted at `cwd`.
pub fn manifest_path(cwd: &Path) -> PathBuf {
    cwd.join(SOCKET_DIR).join(MANIFEST_FILE)
}

/// Queue key for manifest mutations of one project. Relative and absolute
/// spellings of the same directory share a key.
fn queue_key(cwd: &Path) -> String {
    let cwd = std::path::absolute(cwd).unwrap_or_else(|_| cwd.to_path_buf());
    format!("manifest:{}", cwd.display())
}

/// Durable, atomically written record of the patches applied to a project.
///
/// Lives at `{cwd}/.socket/manifest.json`. Mutations are serialized per
/// project through the shared [`OperationQueue`]; reads are not queued and
/// always see the last committed file.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    queue: Arc<OperationQueue>,
}

impl ManifestStore {
    pub fn new(queue: Arc<OperationQueue>) -> Self {
        Self { queue }
    }

    /// Load the manifest. A missing file yields an empty manifest.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_manifest(&self, cwd: &Path) -> Result<PatchManifest, PatchError> {
        load(&manifest_path(cwd)).await
    }

    /// Validate and atomically replace the manifest.
    #[instrument(skip(self, manifest), level = "debug", fields(patches = manifest.patches.len()))]
    pub async fn write_manifest(
        &self,
        cwd: &Path,
        manifest: &PatchManifest,
    ) -> Result<(), PatchError> {
        save(&manifest_path(cwd), manifest).await
    }

    /// Whether a manifest file exists for the project.
    pub async fn manifest_exists(&self, cwd: &Path) -> bool {
        fs::try_exists(manifest_path(cwd)).await.unwrap_or(false)
    }

    // =========================================================================
    // Queued mutations
    // =========================================================================

    /// Insert or replace the record for `package_id`.
    #[instrument(skip(self, record), level = "debug", fields(uuid = %record.uuid))]
    pub async fn add_patch(
        &self,
        cwd: &Path,
        package_id: &str,
        record: PatchRecord,
    ) -> Result<(), PatchError> {
        let path = manifest_path(cwd);
        let package_id = package_id.to_string();

        self.queue
            .run(queue_key(cwd), move || async move {
                let mut manifest = load(&path).await?;
                manifest.upsert(package_id.clone(), record);
                save(&path, &manifest).await?;
                debug!("Added patch for {}", package_id);
                Ok(())
            })
            .await
    }

    /// Remove the record for `package_id`. Returns `false`, without touching
    /// the file, when there was nothing to remove.
    #[instrument(skip(self), level = "debug")]
    pub async fn remove_patch(&self, cwd: &Path, package_id: &str) -> Result<bool, PatchError> {
        let path = manifest_path(cwd);
        let package_id = package_id.to_string();

        self.queue
            .run(queue_key(cwd), move || async move {
                let mut manifest = load(&path).await?;
                if manifest.remove(&package_id).is_none() {
                    debug!("No patch recorded for {}, nothing to remove", package_id);
                    return Ok(false);
                }
                save(&path, &manifest).await?;
                debug!("Removed patch for {}", package_id);
                Ok(true)
            })
            .await
    }

    /// Move the record for `package_id` to `status`. Fails with
    /// [`PatchError::PatchNotFound`] when the package has no record.
    #[instrument(skip(self, applied_to), level = "debug")]
    pub async fn update_patch_status(
        &self,
        cwd: &Path,
        package_id: &str,
        status: PatchStatus,
        applied_to: Option<Vec<PathBuf>>,
    ) -> Result<PatchRecord, PatchError> {
        let path = manifest_path(cwd);
        let package_id = package_id.to_string();

        self.queue
            .run(queue_key(cwd), move || async move {
                let mut manifest = load(&path).await?;
                let record = manifest
                    .patches
                    .get_mut(&package_id)
                    .ok_or_else(|| PatchError::PatchNotFound(package_id.clone()))?;
                record.transition(status, applied_to);
                let updated = record.clone();
                save(&path, &manifest).await?;
                debug!("Patch for {} is now {}", package_id, status);
                Ok(updated)
            })
            .await
    }

    // =========================================================================
    // Unqueued reads
    // =========================================================================

    pub async fn get_patch(
        &self,
        cwd: &Path,
        package_id: &str,
    ) -> Result<Option<PatchRecord>, PatchError> {
        let mut manifest = self.read_manifest(cwd).await?;
        Ok(manifest.remove(package_id))
    }

    /// Package identifiers with a recorded patch, in sorted order.
    pub async fn list_patches(&self, cwd: &Path) -> Result<Vec<String>, PatchError> {
        let manifest = self.read_manifest(cwd).await?;
        Ok(manifest.patches.into_keys().collect())
    }

    pub async fn has_patch(&self, cwd: &Path, package_id: &str) -> Result<bool, PatchError> {
        Ok(self.read_manifest(cwd).await?.contains(package_id))
    }

    pub async fn get_all_patches(
        &self,
        cwd: &Path,
    ) -> Result<BTreeMap<String, PatchRecord>, PatchError> {
        Ok(self.read_manifest(cwd).await?.patches)
    }

    /// `true` when the manifest is absent or valid. Errors are logged, not
    /// returned.
    pub async fn validate_manifest(&self, cwd: &Path) -> bool {
        match self.read_manifest(cwd).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Manifest at {} is invalid: {}", manifest_path(cwd).display(), e);
                false
            }
        }
    }
}

async fn load(path: &Path) -> Result<PatchManifest, PatchError> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let manifest = PatchManifest::from_json(&json)?;
            debug!("Loaded manifest with {} patches", manifest.patches.len());
            Ok(manifest)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PatchManifest::default()),
        Err(e) => Err(PatchError::Io(format!(
            "Failed to read manifest {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn save(path: &Path, manifest: &PatchManifest) -> Result<(), PatchError> {
    manifest.validate()?;
    let json = manifest.to_json()?;
    write_atomic(path, json.as_bytes()).await?;
    debug!("Saved manifest with {} patches", manifest.patches.len());
    Ok(())
}
