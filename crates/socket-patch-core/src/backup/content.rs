use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, instrument};

use crate::atomic::write_atomic;
use crate::error::PatchError;
use crate::integrity::Integrity;

/// Storage addressed by the integrity string of its content.
///
/// Identical bytes are stored once no matter how many files or patches
/// reference them.
#[async_trait]
pub trait ContentStore: Send + Sync + Debug {
    /// Returns the store identifier (e.g., "local").
    fn store_name(&self) -> &'static str;

    /// Store `data`, returning the integrity string that now addresses it.
    async fn put(&self, data: Vec<u8>) -> Result<Integrity, PatchError>;

    /// Fetch content by integrity. `Ok(None)` when absent; an
    /// [`PatchError::IntegrityMismatch`] when the stored bytes no longer hash
    /// to `integrity`.
    async fn get(&self, integrity: &Integrity) -> Result<Option<Vec<u8>>, PatchError>;

    async fn contains(&self, integrity: &Integrity) -> Result<bool, PatchError>;

    /// Delete content. Returns whether anything was removed.
    async fn remove(&self, integrity: &Integrity) -> Result<bool, PatchError>;
}

/// Content store on the local filesystem.
///
/// Layout:
/// ```text
/// {root}/
///   sha256/
///     ab/
///       cd/
///         ef0123...   (remaining hex digits)
/// ```
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for `integrity`.
    fn content_path(&self, integrity: &Integrity) -> PathBuf {
        let hex = integrity.to_hex();
        self.root
            .join(integrity.algorithm().as_str())
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex[4..])
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    fn store_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn put(&self, data: Vec<u8>) -> Result<Integrity, PatchError> {
        let (integrity, data) = Integrity::compute(data).await?;
        let path = self.content_path(&integrity);

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Content {} already stored", integrity);
            return Ok(integrity);
        }

        write_atomic(&path, &data).await?;
        debug!("Stored content {} ({} bytes)", integrity, data.len());
        Ok(integrity)
    }

    #[instrument(skip(self), level = "debug", fields(integrity = %integrity))]
    async fn get(&self, integrity: &Integrity) -> Result<Option<Vec<u8>>, PatchError> {
        let path = self.content_path(integrity);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PatchError::Io(format!(
                    "Failed to read content {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        integrity.check(&data)?;
        Ok(Some(data))
    }

    async fn contains(&self, integrity: &Integrity) -> Result<bool, PatchError> {
        fs::try_exists(self.content_path(integrity))
            .await
            .map_err(|e| PatchError::Io(format!("Failed to stat content {}: {}", integrity, e)))
    }

    #[instrument(skip(self), level = "debug", fields(integrity = %integrity))]
    async fn remove(&self, integrity: &Integrity) -> Result<bool, PatchError> {
        let path = self.content_path(integrity);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed content {}", integrity);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PatchError::Io(format!(
                "Failed to remove content {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
