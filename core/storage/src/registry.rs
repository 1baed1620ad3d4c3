//! Provider registry and on-disk backend discovery.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::provider::RemoteStorageProvider;
use safesync_common::{Error, Result};

/// Settings file name, both at the root and inside each backend directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Factory function type for creating providers.
///
/// Receives the backend directory, the service base URL and the raw bytes of
/// the backend's `settings.json`.
pub type ProviderFactory =
    Box<dyn Fn(&Path, &str, &[u8]) -> Result<Arc<dyn RemoteStorageProvider>> + Send + Sync>;

/// Root-level settings shared by every backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootSettings {
    #[serde(default)]
    pub base_url: String,
}

impl RootSettings {
    /// Read and validate `{root}/settings.json`.
    ///
    /// # Errors
    /// - File missing or unreadable
    /// - `baseUrl` empty or not an absolute URL
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join(SETTINGS_FILE);
        let data = tokio::fs::read(&path).await.map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let settings: RootSettings = serde_json::from_slice(&data).map_err(|e| {
            Error::Configuration(format!("Invalid {}: {}", path.display(), e))
        })?;

        if settings.base_url.trim().is_empty() {
            return Err(Error::Configuration(
                "baseUrl is required in root settings.json".to_string(),
            ));
        }
        url::Url::parse(&settings.base_url).map_err(|e| {
            Error::Configuration(format!("Invalid baseUrl '{}': {}", settings.base_url, e))
        })?;

        Ok(settings)
    }
}

/// Registry for storage provider factories.
///
/// Registrations are fixed after startup. Discovery instantiates one provider
/// per configured backend directory.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - Returns error if the id is already registered
    pub fn register(&mut self, id: impl Into<String>, factory: ProviderFactory) -> Result<()> {
        let id = id.into();
        if self.factories.contains_key(&id) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                id
            )));
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    /// Get list of registered provider ids.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Discover configured backends under `root`.
    ///
    /// Only the root settings are mandatory. A backend directory without a
    /// registered factory or without its own settings is skipped silently; a
    /// backend whose settings cannot be read or whose factory fails is logged
    /// and skipped.
    ///
    /// # Errors
    /// - Root settings missing or invalid
    /// - Root directory cannot be opened
    pub async fn discover(
        &self,
        root: &Path,
    ) -> Result<HashMap<String, Arc<dyn RemoteStorageProvider>>> {
        let settings = RootSettings::load(root).await?;
        let mut providers = HashMap::new();

        let mut entries = tokio::fs::read_dir(root).await?;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read root directory, stopping discovery");
                    break;
                }
            };
            // Follows symlinks so linked provider directories are found
            match tokio::fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_dir() => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            }
            let name = entry.file_name();
            let Some(id) = name.to_str() else {
                continue;
            };
            let Some(factory) = self.factories.get(id) else {
                continue;
            };

            let dir = entry.path();
            let settings_path = dir.join(SETTINGS_FILE);
            let data = match tokio::fs::read(&settings_path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(provider = %id, "No settings.json, skipping provider");
                    continue;
                }
                Err(e) => {
                    warn!(provider = %id, error = %e, "Failed to read provider settings");
                    continue;
                }
            };

            match factory(&dir, &settings.base_url, &data) {
                Ok(provider) => {
                    info!(provider = %id, "Discovered storage provider");
                    providers.insert(id.to_string(), provider);
                }
                Err(e) => {
                    warn!(provider = %id, error = %e, "Failed to initialize provider");
                }
            }
        }

        Ok(providers)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in providers.
pub fn create_default_registry() -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    registry.register(
        crate::onedrive::PROVIDER_ID,
        Box::new(|dir, base_url, settings| {
            crate::onedrive::create_onedrive_provider(dir, base_url, settings)
        }),
    )?;

    Ok(registry)
}
