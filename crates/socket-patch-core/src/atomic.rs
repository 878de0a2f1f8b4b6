use std::fs::Permissions;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::PatchError;

/// Sibling temp path for `target`, unique per writer so concurrent writers
/// never share a temp file.
pub(crate) fn temp_path_for(target: &Path) -> PathBuf {
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let name = format!(".{}.{}.tmp", base, Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Write `data` to `target` via a synced sibling temp file and a rename, so
/// readers see either the old or the new content and never a partial file.
///
/// An existing target keeps its permissions.
pub(crate) async fn write_atomic(target: &Path, data: &[u8]) -> Result<(), PatchError> {
    write_atomic_with_mode(target, data, None).await
}

/// Like [`write_atomic`], but the file ends up with `mode` when given.
pub(crate) async fn write_atomic_with_mode(
    target: &Path,
    data: &[u8],
    mode: Option<u32>,
) -> Result<(), PatchError> {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|e| {
            PatchError::Io(format!("Failed to create dir {}: {}", parent.display(), e))
        })?;
    }

    let permissions = match mode.and_then(permissions_from_mode) {
        Some(permissions) => Some(permissions),
        None => fs::metadata(target).await.ok().map(|m| m.permissions()),
    };

    let temp_path = temp_path_for(target);

    let written = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        if let Some(permissions) = permissions {
            fs::set_permissions(&temp_path, permissions).await?;
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PatchError::Io(format!(
            "Failed to write {}: {}",
            temp_path.display(),
            e
        )));
    }

    if let Err(e) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(PatchError::Io(format!(
            "Failed to rename to {}: {}",
            target.display(),
            e
        )));
    }

    Ok(())
}

/// Permission bits of a file, where the platform has them.
#[cfg(unix)]
pub(crate) fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub(crate) fn file_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn permissions_from_mode(mode: u32) -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn permissions_from_mode(_mode: u32) -> Option<Permissions> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parents_and_replaces() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("a/b/data.json");

        write_atomic(&target, b"first").await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"first");

        write_atomic(&target, b"second").await.unwrap();
        assert_eq!(fs::read(&target).await.unwrap(), b"second");

        // No temp files left behind.
        let mut entries = fs::read_dir(target.parent().unwrap()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["data.json".to_string()]);
    }

    #[test]
    fn test_temp_paths_are_unique_siblings() {
        let target = Path::new("/tmp/x/manifest.json");
        let a = temp_path_for(target);
        let b = temp_path_for(target);
        assert_ne!(a, b);
        assert_eq!(a.parent(), target.parent());
        assert!(a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(".manifest.json."));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = temp.path().join("bin/cli.js");
        write_atomic(&target, b"#!/usr/bin/env node").await.unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).unwrap();

        write_atomic(&target, b"#!/usr/bin/env node\n// patched").await.unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_explicit_mode_wins() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("run.sh");
        write_atomic(&target, b"echo hi").await.unwrap();

        write_atomic_with_mode(&target, b"echo hi", Some(0o700)).await.unwrap();
        let metadata = std::fs::metadata(&target).unwrap();
        assert_eq!(file_mode(&metadata), Some(0o700));
    }
}
