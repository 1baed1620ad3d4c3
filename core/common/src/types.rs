//! Common types used throughout SafeSync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Extension of password-safe files handled by every backend.
pub const SAFE_EXTENSION: &str = ".psafe3";

/// Check whether a file name carries the safe extension (case-insensitive).
pub fn is_safe_file(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(SAFE_EXTENSION)
}

/// A folder path as reported by a remote backend, independent of the local
/// filesystem.
///
/// Both `/` and `\` are accepted as separators. Leading separators, empty
/// components and `.` are dropped; `..` is rejected so a remote listing can
/// never address anything outside the local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    components: Vec<String>,
}

impl RemotePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse a remote folder path.
    ///
    /// # Errors
    /// - Returns error if any component is `..` or carries a drive prefix
    pub fn parse(path: &str) -> crate::Result<Self> {
        let mut components = Vec::new();
        for comp in path.split(['/', '\\']) {
            match comp {
                "" | "." => continue,
                ".." => {
                    return Err(crate::Error::InvalidInput(format!(
                        "Path '{}' escapes its root",
                        path
                    )));
                }
                c if c.contains(':') && components.is_empty() && c.len() == 2 => {
                    return Err(crate::Error::InvalidInput(format!(
                        "Path '{}' carries a drive prefix",
                        path
                    )));
                }
                c => components.push(c.to_string()),
            }
        }
        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Resolve a file `name` inside this folder under a local `root`.
    ///
    /// # Errors
    /// - Returns error if `name` is empty, `.`/`..`, or contains separators
    pub fn to_local(&self, root: &Path, name: &str) -> crate::Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid file name '{}'",
                name
            )));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(crate::Error::InvalidInput(format!(
                "File name '{}' cannot contain separators",
                name
            )));
        }
        let mut local = root.to_path_buf();
        for component in &self.components {
            local.push(component);
        }
        local.push(name);
        Ok(local)
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}
