//! Local mirror of a provider's selected files.
//!
//! The mirror is the provider directory itself. Hidden entries (credentials,
//! state, anything starting with a dot) are never touched by cleanup, and
//! downloads land under a temporary sibling until complete.

use futures::TryStreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use safesync_common::fs::{
    create_private_dir_all, create_private_file, remove_if_exists, temp_sibling,
};
use safesync_common::{is_safe_file, Error, RemotePath, Result};
use safesync_storage::Download;

use crate::state::SelectedFile;

/// Suffix of in-progress downloads.
const TEMP_SUFFIX: &str = ".tmp";

/// Whether `name` is an in-progress (or abandoned) safe download.
pub fn is_download_temp(name: &str) -> bool {
    name.strip_suffix(TEMP_SUFFIX).is_some_and(is_safe_file)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

/// Walk `root` recursively, skipping hidden entries below it.
pub(crate) fn visible_entries(root: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable mirror entry");
                None
            }
        })
}

/// Remove now-empty directories from `path`'s parent upwards, stopping
/// before `root`.
fn prune_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        debug!(dir = %dir.display(), "Pruned empty directory");
        current = dir.parent();
    }
}

fn remove_unselected(root: &Path, keep: &HashSet<PathBuf>) -> Vec<PathBuf> {
    if !root.is_dir() {
        return Vec::new();
    }

    let stale: Vec<PathBuf> = visible_entries(root)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            (is_safe_file(&name) && !keep.contains(e.path())) || is_download_temp(&name)
        })
        .map(DirEntry::into_path)
        .collect();

    let mut removed = Vec::with_capacity(stale.len());
    for path in stale {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed unselected file");
                prune_parents(root, &path);
                removed.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
        }
    }
    removed
}

fn remove_empty_dirs(root: &Path) {
    if !root.is_dir() {
        return;
    }
    let dirs: Vec<PathBuf> = visible_entries(root)
        .filter(|e| e.depth() > 0 && e.file_type().is_dir())
        .map(DirEntry::into_path)
        .collect();

    // Pre-order reversed visits children before their parents
    for dir in dirs.iter().rev() {
        if std::fs::remove_dir(dir).is_ok() {
            debug!(dir = %dir.display(), "Removed empty directory");
        }
    }
}

/// Local mirror rooted at a provider directory.
///
/// Directory walks run on the blocking pool and outlive a dropped caller;
/// `settled` waits for them.
#[derive(Debug, Clone)]
pub struct Mirror {
    root: PathBuf,
    walks: Arc<Mutex<()>>,
}

impl Mirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            walks: Arc::new(Mutex::new(())),
        }
    }

    /// Wait until no cleanup or wipe is running on the blocking pool.
    pub async fn settled(&self) {
        let _guard = self.walks.lock().await;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local destination of a selected file.
    ///
    /// # Errors
    /// - Remote path contains `..` or a drive prefix
    /// - Name is empty, `.`/`..`, or contains a separator
    /// - Name is not a safe file, or the name or a folder is hidden
    pub fn local_path(&self, file: &SelectedFile) -> Result<PathBuf> {
        let remote = RemotePath::parse(&file.path)?;
        let hidden = file.name.starts_with('.')
            || remote.components().iter().any(|c| c.starts_with('.'));
        if hidden || !is_safe_file(&file.name) {
            return Err(Error::InvalidInput(format!(
                "Refusing to mirror '{}' from '{}'",
                file.name, file.path
            )));
        }
        remote.to_local(&self.root, &file.name)
    }

    /// Stream a download into `dest`.
    ///
    /// Content goes to `<dest>.tmp` first and is renamed over `dest` once
    /// complete; on failure the temporary file is removed and any previous
    /// copy of `dest` stays untouched.
    pub async fn write_download(&self, dest: &Path, download: Download) -> Result<()> {
        if let Some(parent) = dest.parent() {
            create_private_dir_all(parent).await?;
        }

        let tmp = temp_sibling(dest);
        let written = async {
            let mut file = create_private_file(&tmp).await?;
            let mut reader = StreamReader::new(download.content.map_err(std::io::Error::other));
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, dest).await?;
            Ok::<(), Error>(())
        }
        .await;

        if written.is_err() {
            let _ = remove_if_exists(&tmp).await;
        }
        written
    }

    /// Delete every visible safe file not in `keep` and every abandoned
    /// download, pruning directories left empty (the root itself stays).
    ///
    /// Returns the removed files.
    pub async fn cleanup(&self, keep: &HashSet<PathBuf>) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        let keep = keep.clone();
        let walk = self.walks.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _walk = walk;
            remove_unselected(&root, &keep)
        })
            .await
            .map_err(|e| Error::Storage(format!("Mirror cleanup failed: {}", e)))
    }

    /// Delete all mirrored safes, abandoned downloads and empty directories.
    ///
    /// Hidden files and other non-safe files stay. Returns the number of
    /// removed files.
    pub async fn clear(&self) -> Result<usize> {
        let root = self.root.clone();
        let walk = self.walks.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _walk = walk;
            let removed = remove_unselected(&root, &HashSet::new()).len();
            remove_empty_dirs(&root);
            removed
        })
        .await
        .map_err(|e| Error::Storage(format!("Mirror wipe failed: {}", e)))
    }
}
