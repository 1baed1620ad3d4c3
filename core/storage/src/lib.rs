//! Storage provider abstraction for SafeSync.
//!
//! This module provides the capability contract remote backends implement
//! (OneDrive, plus an in-memory backend for tests), a registry that discovers
//! configured backends on disk, and the credential persistence shared by
//! OAuth backends.
//!
//! # Design Principles
//! - Backends implement primitives only: auth lifecycle, list, download
//! - Async operations: dropping a future cancels the operation
//! - Streaming downloads: content is never buffered whole
//! - Fail-soft discovery: one broken backend never hides the others

pub mod credentials;
pub mod memory;
pub mod onedrive;
pub mod provider;
pub mod registry;

pub use credentials::{Credential, CredentialStore, FileCredentialStore, VerifierStore};
pub use memory::MemoryProvider;
pub use onedrive::{create_onedrive_provider, OneDriveProvider};
pub use provider::{
    ByteStream, ConnectionStatus, Download, ProviderInfo, RemoteFile, RemoteStorageProvider,
};
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry, RootSettings};
