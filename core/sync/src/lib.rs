//! SafeSync sync engine
//!
//! Mirrors selected remote safes into a local directory per provider:
//! - Persisted selection state
//! - Local mirror with atomic downloads and pruning
//! - Sync orchestrator and periodic background loop
//! - Catalog of locally available safes and static safe management

pub mod catalog;
pub mod engine;
pub mod mirror;
pub mod scheduler;
pub mod state;

pub use catalog::{
    import_static, list_safes, remove_static, sanitize_filename, SafeFile, MAX_STATIC_SIZE,
    STATIC_SOURCE,
};
pub use engine::{ProviderStatus, SyncOrchestrator, SyncResult, DEFAULT_SYNC_INTERVAL};
pub use mirror::{is_download_temp, Mirror};
pub use scheduler::PeriodicSync;
pub use state::{ConfigStore, SelectedFile, SyncConfig, CONFIG_FILE};
