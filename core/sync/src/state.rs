//! Persisted selection state per provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use safesync_common::fs::{remove_if_exists, write_private};
use safesync_common::Result;

/// State file name inside a provider directory.
pub const CONFIG_FILE: &str = ".config.json";

/// A remote file and whether the user wants it mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedFile {
    /// Backend id of the file; identity key.
    pub id: String,
    pub name: String,
    /// Remote parent folder path.
    pub path: String,
    pub selected: bool,
}

/// Persistent sync state of one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Selection set as last saved.
    #[serde(default)]
    pub files: Vec<SelectedFile>,
    /// End of the last completed sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncConfig {
    /// Files marked for mirroring.
    pub fn selected(&self) -> impl Iterator<Item = &SelectedFile> {
        self.files.iter().filter(|f| f.selected)
    }

    /// Ids of the files marked for mirroring.
    pub fn selected_ids(&self) -> HashSet<&str> {
        self.selected().map(|f| f.id.as_str()).collect()
    }
}

/// Reads and writes `.config.json`.
///
/// Read-modify-write cycles are serialized so a selection saved while a sync
/// records its completion time is never lost.
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    /// Store state in `dir/.config.json`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CONFIG_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file yields the empty state.
    pub async fn load(&self) -> Result<SyncConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `f` to the current state and persist the result atomically.
    pub async fn update<F>(&self, f: F) -> Result<SyncConfig>
    where
        F: FnOnce(&mut SyncConfig),
    {
        let _guard = self.lock.lock().await;
        let mut config = self.load().await?;
        f(&mut config);
        self.write(&config).await?;
        Ok(config)
    }

    /// Replace the selection set, keeping the last sync time.
    pub async fn set_files(&self, files: Vec<SelectedFile>) -> Result<SyncConfig> {
        self.update(move |config| config.files = files).await
    }

    /// Record the completion time of a sync, keeping the selection set.
    pub async fn mark_synced(&self, at: DateTime<Utc>) -> Result<SyncConfig> {
        self.update(move |config| config.last_sync_time = Some(at))
            .await
    }

    /// Delete the state file. Succeeds when none exists.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        remove_if_exists(&self.path).await?;
        Ok(())
    }

    async fn write(&self, config: &SyncConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        write_private(&self.path, &json).await
    }
}
