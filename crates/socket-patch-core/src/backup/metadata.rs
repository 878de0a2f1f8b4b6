use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::write_atomic;
use crate::error::PatchError;
use crate::integrity::Integrity;

/// One backed-up file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFileInfo {
    pub integrity: Integrity,
    pub size: u64,
    pub original_path: PathBuf,
    pub backed_up_at: DateTime<Utc>,
    /// Unix permission bits at backup time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Every file backed up for one patch UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub uuid: String,
    pub patched_at: DateTime<Utc>,
    /// Absolute path (as a string) -> backup info
    #[serde(default)]
    pub files: BTreeMap<String, BackupFileInfo>,
}

impl BackupMetadata {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            patched_at: Utc::now(),
            files: BTreeMap::new(),
        }
    }

    pub fn file(&self, path: &Path) -> Option<&BackupFileInfo> {
        self.files.get(&path_key(path))
    }

    /// Record `info` unless the path already has a backup; the first
    /// snapshot wins. Returns the info now on record.
    pub fn insert_if_absent(&mut self, info: BackupFileInfo) -> &BackupFileInfo {
        self.files
            .entry(path_key(&info.original_path))
            .or_insert(info)
    }

    pub fn original_paths(&self) -> Vec<PathBuf> {
        self.files
            .values()
            .map(|info| info.original_path.clone())
            .collect()
    }

    pub fn references(&self, integrity: &Integrity) -> bool {
        self.files.values().any(|info| &info.integrity == integrity)
    }
}

pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Persisted metadata records, one JSON file per UUID.
///
/// File names are the SHA-256 hex of the UUID so arbitrary identifiers never
/// reach the filesystem:
/// ```text
/// {root}/
///   {sha256(uuid)}.json
/// ```
#[derive(Debug, Clone)]
pub(crate) struct MetadataIndex {
    root: PathBuf,
}

impl MetadataIndex {
    pub(crate) fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self, uuid: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(uuid.as_bytes()));
        self.root.join(format!("{}.json", name))
    }

    pub(crate) async fn load(&self, uuid: &str) -> Result<Option<BackupMetadata>, PatchError> {
        let path = self.record_path(uuid);
        match fs::read_to_string(&path).await {
            Ok(json) => {
                let metadata: BackupMetadata = serde_json::from_str(&json).map_err(|e| {
                    PatchError::Serialization(format!(
                        "Failed to parse backup metadata for {}: {}",
                        uuid, e
                    ))
                })?;
                Ok(Some(metadata))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PatchError::Io(format!(
                "Failed to read backup metadata {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub(crate) async fn save(&self, metadata: &BackupMetadata) -> Result<(), PatchError> {
        let json = serde_json::to_string_pretty(metadata).map_err(|e| {
            PatchError::Serialization(format!("Failed to serialize backup metadata: {}", e))
        })?;
        write_atomic(&self.record_path(&metadata.uuid), json.as_bytes()).await?;
        debug!(
            "Saved backup metadata for {} ({} files)",
            metadata.uuid,
            metadata.files.len()
        );
        Ok(())
    }

    pub(crate) async fn delete(&self, uuid: &str) -> Result<bool, PatchError> {
        let path = self.record_path(uuid);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PatchError::Io(format!(
                "Failed to delete backup metadata {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Every readable record. Unreadable ones are skipped with a warning.
    pub(crate) async fn load_all(&self) -> Result<Vec<BackupMetadata>, PatchError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(PatchError::Io(format!(
                    "Failed to read dir {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PatchError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }

            let parsed = match fs::read_to_string(&path).await {
                Ok(json) => serde_json::from_str::<BackupMetadata>(&json)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(metadata) => records.push(metadata),
                Err(e) => warn!("Skipping unreadable backup metadata {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(path: &str, content: &[u8]) -> BackupFileInfo {
        BackupFileInfo {
            integrity: Integrity::from_bytes(content),
            size: content.len() as u64,
            original_path: PathBuf::from(path),
            backed_up_at: Utc::now(),
            mode: None,
        }
    }

    #[test]
    fn test_first_snapshot_wins() {
        let mut metadata = BackupMetadata::new("uuid-1");
        metadata.insert_if_absent(info("/p/a.js", b"original"));
        let kept = metadata.insert_if_absent(info("/p/a.js", b"patched")).clone();

        assert_eq!(kept.integrity, Integrity::from_bytes(b"original"));
        assert_eq!(metadata.files.len(), 1);
        assert!(metadata.references(&Integrity::from_bytes(b"original")));
        assert!(!metadata.references(&Integrity::from_bytes(b"patched")));
    }

    #[tokio::test]
    async fn test_index_save_load_delete() {
        let temp = TempDir::new().unwrap();
        let index = MetadataIndex::new(temp.path());

        assert!(index.load("uuid-1").await.unwrap().is_none());

        let mut metadata = BackupMetadata::new("uuid-1");
        metadata.insert_if_absent(info("/p/a.js", b"a"));
        index.save(&metadata).await.unwrap();

        let loaded = index.load("uuid-1").await.unwrap().unwrap();
        assert_eq!(loaded, metadata);
        assert_eq!(loaded.file(Path::new("/p/a.js")).unwrap().size, 1);

        assert!(index.delete("uuid-1").await.unwrap());
        assert!(!index.delete("uuid-1").await.unwrap());
        assert!(index.load("uuid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hostile_uuid_stays_inside_root() {
        let temp = TempDir::new().unwrap();
        let index = MetadataIndex::new(temp.path().join("index"));

        let metadata = BackupMetadata::new("../../etc/passwd");
        index.save(&metadata).await.unwrap();

        assert!(index.record_path("../../etc/passwd").starts_with(temp.path().join("index")));
        assert_eq!(
            index.load("../../etc/passwd").await.unwrap().unwrap().uuid,
            "../../etc/passwd"
        );
    }

    #[tokio::test]
    async fn test_load_all_skips_garbage() {
        let temp = TempDir::new().unwrap();
        let index = MetadataIndex::new(temp.path());

        assert!(index.load_all().await.unwrap().is_empty());

        index.save(&BackupMetadata::new("b")).await.unwrap();
        index.save(&BackupMetadata::new("a")).await.unwrap();
        std::fs::write(temp.path().join("broken.json"), "{").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignore me").unwrap();

        let uuids: Vec<String> = index
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.uuid)
            .collect();
        assert_eq!(uuids, vec!["a".to_string(), "b".to_string()]);
    }
}
