//! Sync orchestrator shared by every storage provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use safesync_common::{Error, Result};
use safesync_storage::{ProviderInfo, RemoteStorageProvider};

use crate::mirror::Mirror;
use crate::scheduler::PeriodicSync;
use crate::state::{ConfigStore, SelectedFile, SyncConfig};

/// Default interval between background syncs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shortest accepted background sync interval.
const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of mirroring one selected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub name: String,
    pub success: bool,
    /// `Last-Modified` reported by the backend for the download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn succeeded(name: &str, last_modified: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            last_modified,
            error: None,
        }
    }

    fn failed(name: &str, error: &Error) -> Self {
        Self {
            name: name.to_string(),
            success: false,
            last_modified: None,
            error: Some(error.to_string()),
        }
    }
}

/// Combined provider and sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub display_name: String,
    pub connected: bool,
    pub needs_reauth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    pub next_sync_at: DateTime<Utc>,
}

/// Background loop owned by an orchestrator.
struct Background {
    shutdown: CancellationToken,
    handle: JoinHandle<u64>,
}

/// Drives list/select/download/cleanup for one provider.
///
/// The mirror lives in `{root}/{provider id}`. Sync and disconnect hold the
/// orchestrator lock exclusively, so at most one of them runs at a time per
/// provider; status queries share it.
pub struct SyncOrchestrator {
    provider: Arc<dyn RemoteStorageProvider>,
    mirror: Mirror,
    config: ConfigStore,
    lock: RwLock<()>,
    interval: Duration,
    next_sync_at: RwLock<DateTime<Utc>>,
    background: Mutex<Option<Background>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator with the default sync interval.
    pub fn new(provider: Arc<dyn RemoteStorageProvider>, root: impl AsRef<Path>) -> Self {
        Self::with_interval(provider, root, DEFAULT_SYNC_INTERVAL)
    }

    /// Create an orchestrator with a custom sync interval.
    pub fn with_interval(
        provider: Arc<dyn RemoteStorageProvider>,
        root: impl AsRef<Path>,
        interval: Duration,
    ) -> Self {
        let dir = root.as_ref().join(provider.id());
        let interval = interval.max(MIN_SYNC_INTERVAL);

        Self {
            mirror: Mirror::new(&dir),
            config: ConfigStore::new(&dir),
            provider,
            lock: RwLock::new(()),
            interval,
            next_sync_at: RwLock::new(next_after(Utc::now(), interval)),
            background: Mutex::new(None),
        }
    }

    /// The provider this orchestrator drives.
    pub fn provider(&self) -> &Arc<dyn RemoteStorageProvider> {
        &self.provider
    }

    /// Display metadata of the provider.
    pub fn info(&self) -> ProviderInfo {
        self.provider.info()
    }

    /// Mirror directory.
    pub fn dir(&self) -> &Path {
        self.mirror.root()
    }

    /// Background sync interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Scheduled time of the next background sync.
    pub async fn next_sync_at(&self) -> DateTime<Utc> {
        *self.next_sync_at.read().await
    }

    pub(crate) async fn schedule_next(&self) {
        *self.next_sync_at.write().await = next_after(Utc::now(), self.interval);
    }

    async fn load_config_or_default(&self) -> SyncConfig {
        self.config.load().await.unwrap_or_else(|e| {
            warn!(provider = %self.provider.id(), error = %e, "Failed to load sync config");
            SyncConfig::default()
        })
    }

    /// Connection and sync status.
    ///
    /// Verifies the credentials (which may refresh them) so `needs_reauth`
    /// is current.
    pub async fn status(&self) -> Result<ProviderStatus> {
        let _guard = self.lock.read().await;

        let connection = self.provider.connection_status(true).await?;
        let config = self.load_config_or_default().await;

        Ok(ProviderStatus {
            id: self.provider.id().to_string(),
            display_name: self.provider.display_name().to_string(),
            connected: connection.connected,
            needs_reauth: connection.needs_reauth,
            account_name: connection.account_name,
            account_email: connection.account_email,
            last_sync_time: config.last_sync_time,
            next_sync_at: self.next_sync_at().await,
        })
    }

    /// Remote safe files merged with the persisted selection flags.
    ///
    /// When the remote listing fails the persisted selection set is returned
    /// instead, so callers can still render the last known state.
    pub async fn list_files(&self) -> Result<Vec<SelectedFile>> {
        let config = self.load_config_or_default().await;

        match self.provider.list_remote_files().await {
            Ok(remote) => {
                let selected = config.selected_ids();
                Ok(remote
                    .into_iter()
                    .map(|file| SelectedFile {
                        selected: selected.contains(file.id.as_str()),
                        id: file.id,
                        name: file.name,
                        path: file.path,
                    })
                    .collect())
            }
            Err(e) => {
                warn!(
                    provider = %self.provider.id(),
                    error = %e,
                    "Remote listing failed, returning saved selection"
                );
                Ok(config.files)
            }
        }
    }

    /// Replace the persisted selection set.
    pub async fn save_files(&self, files: Vec<SelectedFile>) -> Result<()> {
        let count = files.iter().filter(|f| f.selected).count();
        self.config.set_files(files).await?;
        info!(provider = %self.provider.id(), selected = count, "Saved file selection");
        Ok(())
    }

    /// Mirror every selected file and remove everything else.
    ///
    /// Concurrent calls run one after another. Per-file failures are
    /// reported in the results and do not abort the sync.
    ///
    /// # Errors
    /// - `NotAuthenticated` when the provider is disconnected; nothing is
    ///   written in that case
    /// - Selection state unreadable
    pub async fn sync(&self) -> Result<Vec<SyncResult>> {
        let _guard = self.lock.write().await;
        let provider_id = self.provider.id();

        let connection = self.provider.connection_status(false).await?;
        if !connection.connected {
            return Err(Error::NotAuthenticated);
        }
        self.mirror.settled().await;

        let config = self.config.load().await?;
        let selected: Vec<&SelectedFile> = config.selected().collect();
        info!(provider = %provider_id, files = selected.len(), "Starting sync");

        let mut results = Vec::with_capacity(selected.len());
        let mut keep: HashSet<PathBuf> = HashSet::new();

        for file in selected {
            let outcome = match self.mirror.local_path(file) {
                Ok(dest) => {
                    keep.insert(dest.clone());
                    self.download(file, &dest).await
                }
                Err(e) => Err(e),
            };

            results.push(match outcome {
                Ok(last_modified) => {
                    debug!(provider = %provider_id, file = %file.name, "File synced");
                    SyncResult::succeeded(&file.name, last_modified)
                }
                Err(e) => {
                    warn!(provider = %provider_id, file = %file.name, error = %e, "File sync failed");
                    SyncResult::failed(&file.name, &e)
                }
            });
        }

        match self.mirror.cleanup(&keep).await {
            Ok(removed) if !removed.is_empty() => {
                info!(provider = %provider_id, removed = removed.len(), "Removed unselected files");
            }
            Ok(_) => {}
            Err(e) => error!(provider = %provider_id, error = %e, "Mirror cleanup failed"),
        }

        self.config.mark_synced(Utc::now()).await?;

        let failed = results.iter().filter(|r| !r.success).count();
        info!(
            provider = %provider_id,
            synced = results.len() - failed,
            failed,
            "Sync completed"
        );

        Ok(results)
    }

    async fn download(&self, file: &SelectedFile, dest: &Path) -> Result<Option<String>> {
        let download = self.provider.download_file(&file.id).await?;
        let last_modified = download.last_modified.clone();
        self.mirror.write_download(dest, download).await?;
        Ok(last_modified)
    }

    /// Disconnect the provider and wipe its local state.
    ///
    /// Selection state and mirrored safes are removed even when the provider
    /// fails to disconnect; its error is returned afterwards. Settings and
    /// other non-safe files stay.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let provider_id = self.provider.id();

        let disconnected = self.provider.disconnect().await;
        if let Err(e) = &disconnected {
            warn!(provider = %provider_id, error = %e, "Provider disconnect failed");
        }

        // Every step runs; the first failure is reported
        let config = self.config.delete().await;
        if let Err(e) = &config {
            warn!(provider = %provider_id, error = %e, "Failed to delete sync config");
        }
        let cleared = self.mirror.clear().await;
        match &cleared {
            Ok(removed) => info!(provider = %provider_id, removed, "Provider disconnected"),
            Err(e) => error!(provider = %provider_id, error = %e, "Failed to wipe mirror"),
        }

        disconnected.and(config).and(cleared.map(|_| ()))
    }

    /// One background tick: sync if connected, then reschedule.
    pub(crate) async fn scheduled_sync(&self) {
        let provider_id = self.provider.id();

        match self.provider.connection_status(false).await {
            Ok(status) if status.connected => match self.sync().await {
                Ok(results) => {
                    debug!(provider = %provider_id, files = results.len(), "Periodic sync finished");
                }
                Err(e) => error!(provider = %provider_id, error = %e, "Periodic sync failed"),
            },
            Ok(_) => debug!(provider = %provider_id, "Not connected, skipping periodic sync"),
            Err(e) => warn!(provider = %provider_id, error = %e, "Connection check failed"),
        }

        self.schedule_next().await;
    }

    /// Start the periodic background sync.
    ///
    /// Returns `false` when it is already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return false;
        }

        self.schedule_next().await;
        let shutdown = CancellationToken::new();
        let periodic = PeriodicSync::new(self.clone(), self.interval);
        let handle = tokio::spawn(periodic.run(shutdown.clone()));

        *background = Some(Background { shutdown, handle });
        true
    }

    /// Stop the periodic background sync and wait for it to exit.
    pub async fn stop(&self) {
        let Some(background) = self.background.lock().await.take() else {
            return;
        };

        background.shutdown.cancel();
        match background.handle.await {
            Ok(ticks) => debug!(provider = %self.provider.id(), ticks, "Periodic sync joined"),
            Err(e) => error!(provider = %self.provider.id(), error = %e, "Periodic sync task failed"),
        }
        // A cancelled tick may have left a mirror walk running
        self.mirror.settled().await;
    }

    /// Whether the periodic background sync is running.
    pub async fn is_running(&self) -> bool {
        self.background.lock().await.is_some()
    }
}

fn next_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::minutes(15))
}
