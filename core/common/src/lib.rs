//! Common utilities and types shared across SafeSync modules.
//!
//! This module provides the error type, remote path handling and the private
//! file helpers used by both the storage backends and the sync engine.

pub mod error;
pub mod fs;
pub mod types;

pub use error::{Error, Result};
pub use types::{is_safe_file, RemotePath, SAFE_EXTENSION};
