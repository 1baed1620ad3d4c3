//! Common error types for SafeSync.

use thiserror::Error;

/// Top-level error type for SafeSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Settings are missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Authentication flow or token request failed.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Stored credentials are no longer usable; the user has to authorize again.
    #[error("Reauthentication required: {0}")]
    ReauthRequired(String),

    /// Operation needs a connected backend.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Remote API or transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Local mirror operation failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the error can only be resolved by the user authorizing again.
    pub fn is_reauth_required(&self) -> bool {
        matches!(self, Error::ReauthRequired(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
