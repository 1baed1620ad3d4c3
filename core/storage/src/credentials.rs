//! Credential and PKCE verifier persistence for OAuth backends.
//!
//! Credentials live in a JSON file next to the backend's mirror and are the
//! single source of truth for its connection state. The PKCE verifier only
//! exists between issuing an authorization URL and receiving the callback;
//! its age is taken from the file's mtime so it also expires across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use safesync_common::fs::{remove_if_exists, write_private};
use safesync_common::{Error, Result};

/// Credential file name inside a backend directory.
pub const TOKENS_FILE: &str = ".tokens.json";
/// PKCE verifier file name inside a backend directory.
pub const VERIFIER_FILE: &str = ".code_verifier";
/// Maximum age of a PKCE verifier.
pub const VERIFIER_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Remaining lifetime under which an access token is treated as expired.
const EXPIRY_SKEW_MINUTES: i64 = 5;

/// OAuth2 credentials of a connected account.
///
/// `expires_at` is kept as RFC 3339 text so a corrupted value can be told
/// apart from a missing one.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: String,
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub account_email: String,
}

impl Credential {
    /// Both tokens are present.
    pub fn has_tokens(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }

    /// Parsed expiry.
    ///
    /// `Ok(None)` when no expiry is recorded, `Err` when the value is corrupted.
    pub fn expiry(&self) -> Result<Option<DateTime<Utc>>> {
        if self.expires_at.is_empty() {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&self.expires_at)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::ReauthRequired(format!("Invalid token expiry: {}", e)))
    }

    /// Check if the access token is expired or about to expire.
    ///
    /// A credential without a recorded expiry is considered expired.
    pub fn is_expired(&self) -> Result<bool> {
        Ok(match self.expiry()? {
            Some(expires_at) => expires_at < Utc::now() + Duration::minutes(EXPIRY_SKEW_MINUTES),
            None => true,
        })
    }

    /// Format an expiry `expires_in` from now.
    pub fn expiry_from_now(expires_in: std::time::Duration) -> String {
        let lifetime = Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1));
        (Utc::now() + lifetime).to_rfc3339()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("account_name", &self.account_name)
            .field("account_email", &self.account_email)
            .finish()
    }
}

/// Persistence for a backend's credentials.
///
/// Kept small so a keychain or encrypted store can replace the file store
/// without touching the authorization state machine.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the stored credential, `None` when nothing is stored.
    async fn load(&self) -> Result<Option<Credential>>;

    /// Replace the stored credential.
    async fn store(&self, credential: &Credential) -> Result<()>;

    /// Delete the stored credential. Succeeds when nothing is stored.
    async fn delete(&self) -> Result<()>;
}

/// Credential store backed by an owner-only JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store credentials in `dir/.tokens.json`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(TOKENS_FILE),
        }
    }

    /// Path of the credential file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let credential: Credential = serde_json::from_slice(&data)?;
        Ok(Some(credential))
    }

    async fn store(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_vec_pretty(credential)?;
        write_private(&self.path, &json).await
    }

    async fn delete(&self) -> Result<()> {
        remove_if_exists(&self.path).await?;
        Ok(())
    }
}

/// File holding the PKCE code verifier between authorization and callback.
pub struct VerifierStore {
    path: PathBuf,
    max_age: std::time::Duration,
}

impl VerifierStore {
    /// Store the verifier in `dir/.code_verifier` with the default TTL.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(VERIFIER_FILE),
            max_age: VERIFIER_MAX_AGE,
        }
    }

    /// Path of the verifier file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a fresh verifier, replacing any previous one.
    pub async fn store(&self, verifier: &str) -> Result<()> {
        write_private(&self.path, verifier.as_bytes()).await
    }

    /// Load the verifier if it is still fresh.
    ///
    /// An expired verifier is deleted before the error is returned.
    ///
    /// # Errors
    /// - `NotFound` when no verifier is stored
    /// - `Authentication` when the verifier is older than the TTL
    pub async fn load(&self) -> Result<String> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(
                    "No pending authorization: code verifier missing".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if self.is_expired(metadata.modified()?) {
            remove_if_exists(&self.path).await?;
            return Err(Error::Authentication("Code verifier expired".to_string()));
        }

        let verifier = tokio::fs::read_to_string(&self.path).await?;
        Ok(verifier.trim().to_string())
    }

    /// Delete the verifier. Succeeds when none is stored.
    pub async fn delete(&self) -> Result<()> {
        remove_if_exists(&self.path).await?;
        Ok(())
    }

    /// Remove a verifier left over by an earlier run if it is past its TTL.
    ///
    /// Runs synchronously so it can be used from constructors.
    pub fn cleanup_stale(&self) {
        let Ok(modified) = std::fs::metadata(&self.path).and_then(|m| m.modified()) else {
            return;
        };
        if self.is_expired(modified) && std::fs::remove_file(&self.path).is_ok() {
            info!(path = %self.path.display(), "Removed stale code verifier");
        }
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age > self.max_age,
            Err(_) => {
                debug!("Code verifier mtime lies in the future");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn age_file(path: &Path, age: std::time::Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_credential_expiry() {
        let mut credential = Credential {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: (Utc::now() - Duration::hours(1)).to_rfc3339(),
            account_name: String::new(),
            account_email: String::new(),
        };
        assert!(credential.is_expired().unwrap());

        credential.expires_at = (Utc::now() + Duration::hours(1)).to_rfc3339();
        assert!(!credential.is_expired().unwrap());

        // Inside the skew window
        credential.expires_at = (Utc::now() + Duration::minutes(4)).to_rfc3339();
        assert!(credential.is_expired().unwrap());
    }

    #[test]
    fn test_corrupted_expiry_requires_reauth() {
        let credential = Credential {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: "not-a-date".to_string(),
            account_name: String::new(),
            account_email: String::new(),
        };
        let err = credential.is_expired().unwrap_err();
        assert!(err.is_reauth_required());
    }

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let credential = Credential {
            access_token: "super-secret".to_string(),
            refresh_token: "also-secret".to_string(),
            expires_at: String::new(),
            account_name: "Ada".to_string(),
            account_email: String::new(),
        };
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("also-secret"));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = FileCredentialStore::new(temp.path());

        assert!(store.load().await.unwrap().is_none());

        let credential = Credential {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            expires_at: "2030-01-01T00:00:00+00:00".to_string(),
            account_name: "Ada".to_string(),
            account_email: "ada@example.com".to_string(),
        };
        store.store(&credential).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.refresh_token, "r");
        assert_eq!(loaded.account_email, "ada@example.com");

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["accessToken"], "a");

        store.delete().await.unwrap();
        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verifier_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = VerifierStore::new(temp.path());

        store.store("verifier-value").await.unwrap();
        assert_eq!(store.load().await.unwrap(), "verifier-value");

        store.delete().await.unwrap();
        assert!(matches!(store.load().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_verifier_is_deleted() {
        let temp = TempDir::new().unwrap();
        let store = VerifierStore::new(temp.path());

        store.store("old").await.unwrap();
        age_file(store.path(), std::time::Duration::from_secs(16 * 60));

        assert!(matches!(store.load().await, Err(Error::Authentication(_))));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_cleanup_stale_keeps_fresh_verifier() {
        let temp = TempDir::new().unwrap();
        let store = VerifierStore::new(temp.path());

        store.store("fresh").await.unwrap();
        store.cleanup_stale();
        assert!(store.path().exists());

        age_file(store.path(), std::time::Duration::from_secs(20 * 60));
        store.cleanup_stale();
        assert!(!store.path().exists());
    }
}
