//! SafeSync CLI - Command line interface for mirroring password safes.
//!
//! Discovers the storage providers configured in the data directory, drives
//! their authorization and selection, and runs the periodic sync loops.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use safesync_storage::{create_default_registry, RemoteStorageProvider};
use safesync_sync::{import_static, list_safes, remove_static, SyncOrchestrator};

type Providers = HashMap<String, Arc<dyn RemoteStorageProvider>>;

#[derive(Parser)]
#[command(name = "safesync")]
#[command(about = "SafeSync - Mirror password safes from cloud storage")]
#[command(version)]
struct Cli {
    /// Data directory (default: platform data dir + /safesync).
    #[arg(short, long, env = "SAFESYNC_DIRECTORY", global = true)]
    dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic sync of every connected provider until Ctrl-C.
    Serve {
        /// Seconds between syncs.
        #[arg(
            long,
            env = "SAFESYNC_SYNC_INTERVAL_SECS",
            default_value_t = 900,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        interval_secs: u64,
    },

    /// List configured providers.
    Providers,

    /// Show connection and sync status of a provider.
    Status {
        /// Provider id.
        provider: String,
    },

    /// List remote safes and whether they are selected.
    Files {
        /// Provider id.
        provider: String,
    },

    /// Select exactly the given files for mirroring.
    Select {
        /// Provider id.
        provider: String,

        /// Remote file ids; none clears the selection.
        file_ids: Vec<String>,
    },

    /// Mirror the selected files now.
    Sync {
        /// Provider id.
        provider: String,
    },

    /// Print the authorization URL of a provider.
    AuthUrl {
        /// Provider id.
        provider: String,

        /// Open the URL in the default browser.
        #[arg(long)]
        open: bool,
    },

    /// Complete authorization with the code from the redirect.
    Callback {
        /// Provider id.
        provider: String,

        /// Authorization code.
        code: String,
    },

    /// Disconnect a provider and remove its mirrored safes.
    Disconnect {
        /// Provider id.
        provider: String,
    },

    /// List locally available safes.
    Safes,

    /// Copy a safe into the data directory as a static safe.
    Import {
        /// Safe file to copy.
        file: PathBuf,

        /// Replace a static safe of the same name.
        #[arg(long)]
        overwrite: bool,
    },

    /// Remove a static safe from the data directory.
    Remove {
        /// Name of the static safe.
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let root = data_dir(cli.dir)?;

    match cli.command {
        Commands::Serve { interval_secs } => {
            cmd_serve(&root, Duration::from_secs(interval_secs)).await
        }

        Commands::Providers => cmd_providers(&root).await,

        Commands::Status { provider } => cmd_status(&root, &provider).await,

        Commands::Files { provider } => cmd_files(&root, &provider).await,

        Commands::Select { provider, file_ids } => cmd_select(&root, &provider, &file_ids).await,

        Commands::Sync { provider } => cmd_sync(&root, &provider).await,

        Commands::AuthUrl { provider, open } => cmd_auth_url(&root, &provider, open).await,

        Commands::Callback { provider, code } => cmd_callback(&root, &provider, &code).await,

        Commands::Disconnect { provider } => cmd_disconnect(&root, &provider).await,

        Commands::Safes => cmd_safes(&root).await,

        Commands::Import { file, overwrite } => cmd_import(&root, &file, overwrite).await,

        Commands::Remove { name } => cmd_remove(&root, &name).await,
    }
}

/// Resolve the data directory.
fn data_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => Ok(dir),
        None => dirs::data_dir()
            .map(|d| d.join("safesync"))
            .context("No data directory on this platform, pass --dir"),
    }
}

/// Discover every configured provider.
async fn discover(root: &Path) -> Result<Providers> {
    let registry = create_default_registry().context("Failed to create provider registry")?;
    registry
        .discover(root)
        .await
        .with_context(|| format!("Failed to discover providers in {}", root.display()))
}

/// Build the orchestrator of one provider.
async fn orchestrator(root: &Path, id: &str) -> Result<SyncOrchestrator> {
    let mut providers = discover(root).await?;
    let Some(provider) = providers.remove(id) else {
        let mut known: Vec<String> = providers.into_keys().collect();
        known.sort();
        anyhow::bail!(
            "Unknown provider '{}' (configured: {})",
            id,
            if known.is_empty() { "none".to_string() } else { known.join(", ") }
        );
    };
    Ok(SyncOrchestrator::new(provider, root))
}

/// Run periodic sync loops until interrupted.
async fn cmd_serve(root: &Path, interval: Duration) -> Result<()> {
    let providers = discover(root).await?;
    if providers.is_empty() {
        warn!("No providers configured in {}", root.display());
    }

    let mut running = Vec::with_capacity(providers.len());
    for (id, provider) in providers {
        let orchestrator = Arc::new(SyncOrchestrator::with_interval(provider, root, interval));
        orchestrator.start().await;
        info!(provider = %id, "Started periodic sync");
        running.push(orchestrator);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    for orchestrator in &running {
        orchestrator.stop().await;
    }

    Ok(())
}

/// List configured providers.
async fn cmd_providers(root: &Path) -> Result<()> {
    let providers = discover(root).await?;
    if providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }

    let mut infos: Vec<_> = providers.values().map(|p| p.info()).collect();
    infos.sort_by(|a, b| a.id.cmp(&b.id));

    println!("Providers:");
    for info in infos {
        println!("  {} ({}) {}", info.id, info.display_name, info.brand_color);
    }

    Ok(())
}

/// Show provider status.
async fn cmd_status(root: &Path, id: &str) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    let status = orchestrator
        .status()
        .await
        .context("Failed to get provider status")?;

    println!("{} ({}):", status.display_name, status.id);
    println!("  Connected: {}", if status.connected { "yes" } else { "no" });
    if let Some(name) = &status.account_name {
        println!("  Account: {}", name);
    }
    if let Some(email) = &status.account_email {
        println!("  Email: {}", email);
    }
    match status.last_sync_time {
        Some(time) => println!("  Last sync: {}", time.to_rfc3339()),
        None => println!("  Last sync: never"),
    }
    println!("  Next sync: {}", status.next_sync_at.to_rfc3339());

    if status.needs_reauth {
        println!("\nAuthorization expired. Run `safesync auth-url {}` to reconnect.", id);
    }

    Ok(())
}

/// List remote safes with their selection state.
async fn cmd_files(root: &Path, id: &str) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    let files = orchestrator
        .list_files()
        .await
        .context("Failed to list files")?;

    if files.is_empty() {
        println!("No safes found.");
        return Ok(());
    }

    for file in files {
        let mark = if file.selected { "[x]" } else { "[ ]" };
        println!("  {} {}  {}  ({})", mark, file.id, file.name, file.path);
    }

    Ok(())
}

/// Select exactly `ids` among the current listing.
async fn cmd_select(root: &Path, id: &str, ids: &[String]) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    let mut files = orchestrator
        .list_files()
        .await
        .context("Failed to list files")?;

    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let known: HashSet<&str> = files.iter().map(|f| f.id.as_str()).collect();
    let unknown: Vec<&str> = wanted.difference(&known).copied().collect();
    if !unknown.is_empty() {
        anyhow::bail!("Unknown file ids: {}", unknown.join(", "));
    }

    for file in &mut files {
        file.selected = wanted.contains(file.id.as_str());
    }

    orchestrator
        .save_files(files)
        .await
        .context("Failed to save selection")?;

    println!("Selected {} file(s).", wanted.len());

    Ok(())
}

/// Mirror the selected files now.
async fn cmd_sync(root: &Path, id: &str) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    let results = orchestrator.sync().await.context("Sync failed")?;

    for result in &results {
        match &result.error {
            None => println!("  synced  {}", result.name),
            Some(error) => println!("  failed  {}: {}", result.name, error),
        }
    }

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        anyhow::bail!("{} of {} file(s) failed to sync", failed, results.len());
    }

    println!("Synced {} file(s).", results.len());

    Ok(())
}

/// Print (and optionally open) the authorization URL.
async fn cmd_auth_url(root: &Path, id: &str, open: bool) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    let url = orchestrator
        .provider()
        .auth_url()
        .await
        .context("Failed to build authorization URL")?;

    println!("{}", url);

    if open {
        open::that(&url).context("Failed to open browser")?;
    }

    Ok(())
}

/// Exchange an authorization code.
async fn cmd_callback(root: &Path, id: &str, code: &str) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    orchestrator
        .provider()
        .handle_callback(code)
        .await
        .context("Authorization failed")?;

    let status = orchestrator
        .provider()
        .connection_status(false)
        .await
        .context("Failed to get connection status")?;

    match status.account_email.or(status.account_name) {
        Some(account) => println!("Connected as {}.", account),
        None => println!("Connected."),
    }

    Ok(())
}

/// Disconnect and wipe local state.
async fn cmd_disconnect(root: &Path, id: &str) -> Result<()> {
    let orchestrator = orchestrator(root, id).await?;
    orchestrator
        .disconnect()
        .await
        .context("Failed to disconnect")?;

    println!("Disconnected {}.", id);

    Ok(())
}

/// List locally available safes.
async fn cmd_safes(root: &Path) -> Result<()> {
    let providers = discover(root).await?;
    let safes = list_safes(root, providers.into_keys())
        .await
        .context("Failed to list safes")?;

    if safes.is_empty() {
        println!("No safes available.");
        return Ok(());
    }

    for safe in safes {
        println!(
            "  [{}] {}  {}",
            safe.source,
            safe.path,
            safe.last_modified.to_rfc3339()
        );
    }

    Ok(())
}

/// Import a static safe.
async fn cmd_import(root: &Path, file: &Path, overwrite: bool) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("Failed to create {}", root.display()))?;

    let safe = match import_static(root, file, overwrite).await {
        Err(safesync_common::Error::AlreadyExists(name)) => {
            anyhow::bail!("{} already exists, pass --overwrite to replace it", name)
        }
        result => result.with_context(|| format!("Failed to import {}", file.display()))?,
    };

    println!("Imported {} ({}).", safe.name, safe.path);

    Ok(())
}

/// Remove a static safe.
async fn cmd_remove(root: &Path, name: &str) -> Result<()> {
    remove_static(root, name)
        .await
        .with_context(|| format!("Failed to remove {}", name))?;

    println!("Removed {}.", name);

    Ok(())
}
