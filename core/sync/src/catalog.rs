//! Local catalog of safes available for unlocking.
//!
//! Static safes are uploaded straight into the root directory; mirrored safes
//! live below each provider directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use safesync_common::fs::{remove_if_exists, temp_sibling};
use safesync_common::{is_safe_file, Error, Result, SAFE_EXTENSION};

use crate::mirror::visible_entries;

/// Source of safes placed directly in the root directory.
pub const STATIC_SOURCE: &str = "static";

/// Largest safe accepted as a static import.
pub const MAX_STATIC_SIZE: u64 = 10 * 1024 * 1024;

/// Longest static safe name, in bytes.
const MAX_NAME_LEN: usize = 255;

/// A safe file on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeFile {
    pub name: String,
    /// Path relative to its source directory, starting with `/`.
    pub path: String,
    pub last_modified: DateTime<Utc>,
    /// `static` or the id of the provider that mirrored it.
    pub source: String,
}

fn modified(path: &Path) -> DateTime<Utc> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

fn relative_path(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    format!("/{}", parts.join("/"))
}

fn static_safes(root: &Path) -> Result<Vec<SafeFile>> {
    let mut safes = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !is_safe_file(&name) || !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        safes.push(SafeFile {
            path: relative_path(root, &path),
            last_modified: modified(&path),
            source: STATIC_SOURCE.to_string(),
            name,
        });
    }
    Ok(safes)
}

fn mirrored_safes(dir: &Path, provider_id: &str) -> Vec<SafeFile> {
    if !dir.is_dir() {
        return Vec::new();
    }
    visible_entries(dir)
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_safe_file(&e.file_name().to_string_lossy()))
        .map(|e| SafeFile {
            name: e.file_name().to_string_lossy().into_owned(),
            path: relative_path(dir, e.path()),
            last_modified: modified(e.path()),
            source: provider_id.to_string(),
        })
        .collect()
}

fn scan(root: &Path, provider_ids: &[String]) -> Result<Vec<SafeFile>> {
    let mut safes = static_safes(root)?;
    for id in provider_ids {
        safes.extend(mirrored_safes(&root.join(id), id));
    }
    safes.sort_by(|a, b| (&a.source, &a.path).cmp(&(&b.source, &b.path)));
    Ok(safes)
}

/// List static safes in `root` and the mirrored safes of each provider.
///
/// The root is scanned non-recursively; provider directories recursively with
/// hidden entries skipped. Results are ordered by source, then path.
///
/// # Errors
/// - Root directory unreadable
pub async fn list_safes<I, S>(root: impl Into<PathBuf>, provider_ids: I) -> Result<Vec<SafeFile>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let root = root.into();
    let ids: Vec<String> = provider_ids.into_iter().map(Into::into).collect();

    tokio::task::spawn_blocking(move || scan(&root, &ids))
        .await
        .map_err(|e| Error::Storage(format!("Safe listing failed: {}", e)))?
        .inspect_err(|e| warn!(error = %e, "Failed to list safes"))
}

/// Reduce a user-supplied file name to a plain name safe to use in the root.
///
/// Keeps the last path component and only ASCII letters, digits, `-`, `_`,
/// `.` and spaces; trims spaces and dots from both ends and caps the length.
/// Returns `None` when nothing usable remains.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }

    let mut cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
        .collect();
    cleaned = cleaned.trim_matches([' ', '.']).to_string();
    cleaned.truncate(MAX_NAME_LEN);

    (!cleaned.is_empty()).then_some(cleaned)
}

fn static_name(name: &str) -> Result<String> {
    let sanitized = sanitize_filename(name)
        .ok_or_else(|| Error::InvalidInput(format!("Invalid file name '{}'", name)))?;
    if !is_safe_file(&sanitized) {
        return Err(Error::InvalidInput(format!(
            "Only {} files are allowed: '{}'",
            SAFE_EXTENSION, name
        )));
    }
    Ok(sanitized)
}

/// Copy a safe from `source` into `root` as a static safe.
///
/// The name is taken from `source` and sanitized. An existing static safe of
/// the same name is only replaced with `overwrite`; the copy lands under a
/// temporary name first.
///
/// # Errors
/// - `InvalidInput` for unusable names, non-safe files or oversized files
/// - `AlreadyExists` when the name is taken and `overwrite` is false
/// - Source unreadable or root not writable
pub async fn import_static(root: &Path, source: &Path, overwrite: bool) -> Result<SafeFile> {
    let original = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = static_name(&original)?;

    let metadata = tokio::fs::metadata(source).await?;
    if !metadata.is_file() {
        return Err(Error::InvalidInput(format!(
            "Not a file: {}",
            source.display()
        )));
    }
    if metadata.len() > MAX_STATIC_SIZE {
        return Err(Error::InvalidInput(format!(
            "Safe exceeds {} bytes: {}",
            MAX_STATIC_SIZE,
            source.display()
        )));
    }

    let dest = root.join(&name);
    if !overwrite && tokio::fs::try_exists(&dest).await? {
        return Err(Error::AlreadyExists(name));
    }

    let tmp = temp_sibling(&dest);
    let copied = async {
        tokio::fs::copy(source, &tmp).await?;
        tokio::fs::rename(&tmp, &dest).await?;
        Ok::<(), Error>(())
    }
    .await;
    if copied.is_err() {
        let _ = remove_if_exists(&tmp).await;
    }
    copied?;

    info!(name = %name, "Imported static safe");
    Ok(SafeFile {
        path: relative_path(root, &dest),
        last_modified: modified(&dest),
        source: STATIC_SOURCE.to_string(),
        name,
    })
}

/// Delete the static safe `name` from `root`.
///
/// Only plain safe files directly inside `root` can be removed; mirrored
/// safes belong to their provider.
///
/// # Errors
/// - `InvalidInput` for unusable or non-safe names
/// - `NotFound` when no such static safe exists
pub async fn remove_static(root: &Path, name: &str) -> Result<()> {
    let name = static_name(name)?;
    let dest = root.join(&name);
    if dest.parent() != Some(root) {
        return Err(Error::InvalidInput(format!("Invalid file name '{}'", name)));
    }

    match tokio::fs::symlink_metadata(&dest).await {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Err(Error::InvalidInput(format!("Not a safe file: {}", name))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("Static safe not found: {}", name)));
        }
        Err(e) => return Err(e.into()),
    }

    tokio::fs::remove_file(&dest).await?;
    info!(name = %name, "Removed static safe");
    Ok(())
}
