//! Filesystem helpers for private state files.
//!
//! State and credential files are never written in place: content goes to a
//! temporary sibling first and is renamed over the destination, so readers
//! observe either the old or the new file.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Result;

/// Temporary sibling used while `path` is being written.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Create a directory and its parents, owner-only on Unix.
pub async fn create_private_dir_all(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await?;
    Ok(())
}

/// Open a fresh file for writing, owner read/write only on Unix.
pub async fn create_private_file(path: &Path) -> Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    Ok(options.open(path).await?)
}

/// Atomically replace `path` with `data`.
///
/// Parent directories are created when missing. The file is owner-only on Unix.
pub async fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir_all(parent).await?;
    }

    let tmp = temp_sibling(path);
    let written = async {
        let mut file = create_private_file(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, path).await?;
        Ok::<(), crate::Error>(())
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    written
}

/// Remove a file, treating a missing file as success.
///
/// Returns whether a file was actually removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_temp_sibling() {
        let tmp = temp_sibling(Path::new("/a/b/.config.json"));
        assert_eq!(tmp, PathBuf::from("/a/b/.config.json.tmp"));
    }

    #[tokio::test]
    async fn test_write_private_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.json");

        write_private(&path, b"{}").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"{}");
        assert!(!temp_sibling(&path).exists());
    }

    #[tokio::test]
    async fn test_write_private_replaces_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");

        write_private(&path, b"first").await.unwrap();
        write_private(&path, b"second").await.unwrap();

        assert_eq!(fs::read(&path).await.unwrap(), b"second");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_private_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".tokens.json");
        write_private(&path, b"secret").await.unwrap();

        let mode = fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gone");

        assert!(!remove_if_exists(&path).await.unwrap());
        fs::write(&path, b"x").await.unwrap();
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!path.exists());
    }
}
