//! OneDrive storage provider.
//!
//! Backed by the Microsoft identity platform (authorization code flow with
//! PKCE for public clients) and Microsoft Graph:
//! - Silent token refresh with `invalid_grant` detection
//! - Drive-wide search for safe files with paging
//! - Streaming downloads

pub mod auth;
pub mod client;
pub mod provider;

use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use safesync_common::{Error, Result};

use crate::provider::RemoteStorageProvider;

pub use auth::{AuthConfig, AuthManager, Endpoints, TokenManager, DEFAULT_TENANT};
pub use client::GraphClient;
pub use provider::OneDriveProvider;

/// Provider id and directory name.
pub const PROVIDER_ID: &str = "onedrive";

/// Contents of `{root}/onedrive/settings.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneDriveSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub tenant: Option<String>,
}

/// Redirect URI under the service base URL.
pub fn callback_url(base_url: &str) -> String {
    format!(
        "{}/api/providers/{}/auth/callback",
        base_url.trim_end_matches('/'),
        PROVIDER_ID
    )
}

/// Create a OneDrive provider from its settings.
///
/// # Errors
/// - Settings are not valid JSON
/// - `clientId` missing or empty
pub fn create_onedrive_provider(
    dir: &Path,
    base_url: &str,
    settings: &[u8],
) -> Result<Arc<dyn RemoteStorageProvider>> {
    let settings: OneDriveSettings = serde_json::from_slice(settings)
        .map_err(|e| Error::Configuration(format!("Invalid OneDrive settings: {}", e)))?;

    if settings.client_id.trim().is_empty() {
        return Err(Error::Configuration(
            "OneDrive settings require a clientId".to_string(),
        ));
    }

    let tenant = settings
        .tenant
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TENANT);

    let config = AuthConfig {
        client_id: settings.client_id,
        redirect_url: callback_url(base_url),
        endpoints: Endpoints::for_tenant(tenant),
    };

    Ok(Arc::new(OneDriveProvider::new(dir, config)?))
}
