//! In-memory storage provider for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::provider::{ConnectionStatus, Download, RemoteFile, RemoteStorageProvider};
use safesync_common::{is_safe_file, Error, Result};

/// Size of the chunks a download is split into.
const CHUNK_SIZE: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    file: RemoteFile,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Entry>,
    connected: bool,
    needs_reauth: bool,
    account_name: Option<String>,
    account_email: Option<String>,
    pending_auth: bool,

    list_error: Option<String>,
    failing_downloads: HashSet<String>,
    broken_streams: HashSet<String>,
    disconnect_error: Option<String>,
    download_delay: Option<Duration>,

    downloads: Vec<String>,
    disconnects: usize,
    active_downloads: usize,
    max_active_downloads: usize,
}

/// In-memory storage provider.
///
/// Holds a configurable remote file set and connection state, can be told to
/// fail specific operations, and records the calls made against it.
pub struct MemoryProvider {
    id: String,
    state: RwLock<State>,
}

impl MemoryProvider {
    /// Create a connected provider with id "memory" and no files.
    pub fn new() -> Self {
        Self::with_id("memory")
    }

    /// Create a connected provider with a custom id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(State {
                connected: true,
                account_name: Some("Memory User".to_string()),
                account_email: Some("memory@example.com".to_string()),
                ..Default::default()
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a remote file.
    pub fn put_file(&self, id: &str, name: &str, path: &str, content: impl Into<Vec<u8>>) {
        self.put_file_modified(id, name, path, content, None);
    }

    /// Add or replace a remote file with a modification time.
    pub fn put_file_modified(
        &self,
        id: &str,
        name: &str,
        path: &str,
        content: impl Into<Vec<u8>>,
        last_modified: Option<DateTime<Utc>>,
    ) {
        let entry = Entry {
            file: RemoteFile {
                id: id.to_string(),
                name: name.to_string(),
                path: path.to_string(),
                last_modified,
            },
            content: content.into(),
        };
        self.write().files.insert(id.to_string(), entry);
    }

    /// Remove a remote file.
    pub fn remove_file(&self, id: &str) {
        self.write().files.remove(id);
    }

    /// Set whether the account is connected.
    pub fn set_connected(&self, connected: bool) {
        self.write().connected = connected;
    }

    /// Report `needs_reauth` on refreshing status checks.
    pub fn set_needs_reauth(&self, needs_reauth: bool) {
        self.write().needs_reauth = needs_reauth;
    }

    /// Make `list_remote_files` fail with a network error.
    pub fn fail_listing(&self, message: Option<&str>) {
        self.write().list_error = message.map(str::to_string);
    }

    /// Make `download_file` fail for the given id.
    pub fn fail_download(&self, id: &str) {
        self.write().failing_downloads.insert(id.to_string());
    }

    /// Make the download stream of the given id fail after its first chunk.
    pub fn break_stream(&self, id: &str) {
        self.write().broken_streams.insert(id.to_string());
    }

    /// Make `disconnect` fail after clearing the connection.
    pub fn fail_disconnect(&self, message: Option<&str>) {
        self.write().disconnect_error = message.map(str::to_string);
    }

    /// Delay every `download_file` call.
    pub fn set_download_delay(&self, delay: Option<Duration>) {
        self.write().download_delay = delay;
    }

    /// Ids passed to `download_file`, in call order.
    pub fn downloaded_ids(&self) -> Vec<String> {
        self.read().downloads.clone()
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_count(&self) -> usize {
        self.read().disconnects
    }

    /// Highest number of `download_file` calls observed in flight at once.
    pub fn max_concurrent_downloads(&self) -> usize {
        self.read().max_active_downloads
    }

    fn content_stream(content: Vec<u8>, broken: bool) -> Download {
        let mut chunks: Vec<Result<Bytes>> = content
            .chunks(CHUNK_SIZE)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if broken {
            chunks.truncate(1);
            chunks.push(Err(Error::Network("Connection reset".to_string())));
        }
        Download {
            content: Box::pin(stream::iter(chunks)),
            last_modified: None,
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStorageProvider for MemoryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        "Memory"
    }

    async fn auth_url(&self) -> Result<String> {
        self.write().pending_auth = true;
        Ok(format!("memory://authorize?provider={}", self.id))
    }

    async fn handle_callback(&self, code: &str) -> Result<()> {
        let mut state = self.write();
        if !state.pending_auth {
            return Err(Error::NotFound("No pending authorization".to_string()));
        }
        if code.is_empty() {
            return Err(Error::Authentication("Empty authorization code".to_string()));
        }
        state.pending_auth = false;
        state.connected = true;
        state.needs_reauth = false;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.write();
        state.disconnects += 1;
        state.connected = false;
        state.needs_reauth = false;
        state.pending_auth = false;
        match &state.disconnect_error {
            Some(message) => Err(Error::Storage(message.clone())),
            None => Ok(()),
        }
    }

    async fn connection_status(&self, attempt_refresh: bool) -> Result<ConnectionStatus> {
        let state = self.read();
        if !state.connected {
            return Ok(ConnectionStatus::disconnected());
        }
        Ok(ConnectionStatus {
            connected: true,
            needs_reauth: attempt_refresh && state.needs_reauth,
            account_name: state.account_name.clone(),
            account_email: state.account_email.clone(),
        })
    }

    async fn list_remote_files(&self) -> Result<Vec<RemoteFile>> {
        let state = self.read();
        if !state.connected {
            return Err(Error::NotAuthenticated);
        }
        if let Some(message) = &state.list_error {
            return Err(Error::Network(message.clone()));
        }
        Ok(state
            .files
            .values()
            .filter(|e| is_safe_file(&e.file.name))
            .map(|e| e.file.clone())
            .collect())
    }

    async fn download_file(&self, file_id: &str) -> Result<Download> {
        let delay = {
            let mut state = self.write();
            state.downloads.push(file_id.to_string());
            state.active_downloads += 1;
            state.max_active_downloads = state.max_active_downloads.max(state.active_downloads);
            state.download_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        state.active_downloads -= 1;

        if !state.connected {
            return Err(Error::NotAuthenticated);
        }
        if state.failing_downloads.contains(file_id) {
            return Err(Error::Network(format!("Download of {} failed", file_id)));
        }
        let entry = state
            .files
            .get(file_id)
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", file_id)))?;

        Ok(Self::content_stream(
            entry.content.clone(),
            state.broken_streams.contains(file_id),
        ))
    }
}
