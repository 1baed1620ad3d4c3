//! Remote storage provider trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

use safesync_common::Result;

/// A file as seen by a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// Backend-scoped opaque identifier of the downloadable object.
    pub id: String,
    /// Display name (e.g. "passwords.psafe3").
    pub name: String,
    /// Parent folder path (e.g. "/Documents/Passwords").
    pub path: String,
    /// Last modification time, when the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Connection and authorization state of a backend.
///
/// Derived from the backend's credentials on every query; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub needs_reauth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
}

impl ConnectionStatus {
    /// Status of a backend without usable credentials.
    pub fn disconnected() -> Self {
        Self::default()
    }
}

/// Byte stream type for download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Content of a remote file being downloaded.
///
/// Dropping the value closes the underlying transfer.
pub struct Download {
    /// Live content stream.
    pub content: ByteStream,
    /// Value of the HTTP `Last-Modified` header, if any.
    pub last_modified: Option<String>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// Display metadata for provider pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
    pub icon: String,
    pub brand_color: String,
}

/// Capability contract every remote storage backend implements.
///
/// Backends only implement these primitives; listing merges, downloads to
/// disk, cleanup and scheduling are shared by the sync engine. Dropping a
/// returned future cancels the operation.
#[async_trait]
pub trait RemoteStorageProvider: Send + Sync {
    /// Stable provider identifier (e.g., "onedrive"). Also the name of the
    /// backend's folder on disk.
    fn id(&self) -> &str;

    /// Human-readable name (e.g., "OneDrive").
    fn display_name(&self) -> &str;

    /// Icon as a data URL.
    fn icon(&self) -> &str {
        ""
    }

    /// Brand color as a CSS hex string.
    fn brand_color(&self) -> &str {
        "#888888"
    }

    /// Build an authorization redirect URL.
    ///
    /// Each call may mint a new transient secret, replacing the previous one.
    async fn auth_url(&self) -> Result<String>;

    /// Exchange an authorization code for credentials.
    ///
    /// # Errors
    /// - Transient secret missing or expired
    /// - Exchange rejected upstream
    async fn handle_callback(&self, code: &str) -> Result<()>;

    /// Erase locally held credentials. Succeeds when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    /// Report the connection state.
    ///
    /// With `attempt_refresh == false` only persisted state is read. With
    /// `attempt_refresh == true` the backend also verifies that its
    /// credentials can still produce an access token.
    async fn connection_status(&self, attempt_refresh: bool) -> Result<ConnectionStatus>;

    /// List remote safe files.
    ///
    /// Server-side search over-matches are filtered out here.
    async fn list_remote_files(&self) -> Result<Vec<RemoteFile>>;

    /// Start downloading one file by its backend id.
    async fn download_file(&self, file_id: &str) -> Result<Download>;

    /// Display metadata for this provider.
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id().to_string(),
            display_name: self.display_name().to_string(),
            icon: self.icon().to_string(),
            brand_color: self.brand_color().to_string(),
        }
    }
}
