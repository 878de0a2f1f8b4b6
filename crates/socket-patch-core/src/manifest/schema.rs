use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::integrity::Integrity;

/// Manifest format version written by this crate.
pub const CURRENT_MANIFEST_VERSION: &str = "1.0.0";

/// The per-project record of which patches apply to which packages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchManifest {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: String,
    /// Package identifier -> patch record
    pub patches: BTreeMap<String, PatchRecord>,
}

fn default_version() -> String {
    CURRENT_MANIFEST_VERSION.to_string()
}

impl Default for PatchManifest {
    fn default() -> Self {
        Self {
            version: default_version(),
            patches: BTreeMap::new(),
        }
    }
}

impl PatchManifest {
    /// Parse and validate manifest JSON. Every failure, including malformed
    /// JSON, is reported as a schema validation error.
    pub fn from_json(json: &str) -> Result<Self, PatchError> {
        let manifest: PatchManifest = serde_json::from_str(json)
            .map_err(|e| PatchError::SchemaValidation(format!("Invalid manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Pretty-printed (2-space) JSON with a trailing newline.
    pub fn to_json(&self) -> Result<String, PatchError> {
        let mut json = serde_json::to_string_pretty(self).map_err(|e| {
            PatchError::Serialization(format!("Failed to serialize manifest: {}", e))
        })?;
        json.push('\n');
        Ok(json)
    }

    /// Checks the constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.version.trim().is_empty() {
            return Err(PatchError::SchemaValidation(
                "version must not be empty".to_string(),
            ));
        }

        for (package_id, record) in &self.patches {
            if package_id.trim().is_empty() {
                return Err(PatchError::SchemaValidation(
                    "package identifier must not be empty".to_string(),
                ));
            }
            record.validate().map_err(|e| match e {
                PatchError::SchemaValidation(msg) => {
                    PatchError::SchemaValidation(format!("patches[{}]: {}", package_id, msg))
                }
                other => other,
            })?;
        }

        Ok(())
    }

    pub fn get(&self, package_id: &str) -> Option<&PatchRecord> {
        self.patches.get(package_id)
    }

    /// Insert or replace a patch record.
    pub fn upsert(&mut self, package_id: impl Into<String>, record: PatchRecord) {
        self.patches.insert(package_id.into(), record);
    }

    pub fn remove(&mut self, package_id: &str) -> Option<PatchRecord> {
        self.patches.remove(package_id)
    }

    pub fn contains(&self, package_id: &str) -> bool {
        self.patches.contains_key(package_id)
    }

    /// Package identifiers whose record is in the given state.
    pub fn with_status(&self, status: PatchStatus) -> Vec<&str> {
        self.patches
            .iter()
            .filter(|(_, record)| record.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Where a patch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchStatus {
    Downloaded,
    Applied,
    Failed,
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchStatus::Downloaded => write!(f, "downloaded"),
            PatchStatus::Applied => write!(f, "applied"),
            PatchStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A patch applied (or about to be applied) to one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    pub uuid: String,
    pub exported_at: DateTime<Utc>,
    /// Package-relative path -> before/after fingerprints
    pub files: BTreeMap<String, PatchFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerabilities: Option<BTreeMap<String, Vulnerability>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub status: PatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_to: Option<Vec<PathBuf>>,
}

impl PatchRecord {
    /// A freshly downloaded patch.
    pub fn downloaded(uuid: impl Into<String>, files: BTreeMap<String, PatchFile>) -> Self {
        let now = Utc::now();
        Self {
            uuid: uuid.into(),
            exported_at: now,
            files,
            vulnerabilities: None,
            description: None,
            license: None,
            tier: None,
            status: PatchStatus::Downloaded,
            downloaded_at: Some(now),
            applied_at: None,
            applied_to: None,
        }
    }

    /// Move to `status`, stamping `applied_at` when the patch lands.
    pub fn transition(&mut self, status: PatchStatus, applied_to: Option<Vec<PathBuf>>) {
        self.status = status;
        if status == PatchStatus::Applied {
            self.applied_at = Some(Utc::now());
        }
        if applied_to.is_some() {
            self.applied_to = applied_to;
        }
    }

    fn validate(&self) -> Result<(), PatchError> {
        if self.uuid.trim().is_empty() {
            return Err(PatchError::SchemaValidation(
                "uuid must not be empty".to_string(),
            ));
        }

        for file in self.files.keys() {
            if !is_relative_file_path(file) {
                return Err(PatchError::SchemaValidation(format!(
                    "file path {:?} must be a non-empty relative path",
                    file
                )));
            }
        }

        Ok(())
    }
}

fn is_relative_file_path(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Content fingerprints of a patched file. These are hashes, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchFile {
    pub before_hash: Integrity,
    pub after_hash: Integrity,
}

/// An advisory fixed by a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default)]
    pub cves: Vec<String>,
    pub summary: String,
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
