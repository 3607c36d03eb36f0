//! sync-daemon: headless vault sync client.
//!
//! Binds a local vault folder to the remote sync service, then keeps it in
//! sync: file changes trigger debounced diff/commit cycles.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sync_core::{EventBus, SyncConfig, SyncEvent};
use sync_daemon::{FileWatcher, HttpRemote, LogReindexSink, NativeFs, VaultSession};

/// OS events are coalesced this long before reaching the scheduler.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Vault sync daemon")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// Base URL of the sync API
    #[arg(long, env = "VAULT_SYNC_SERVER")]
    server: String,

    /// Bearer token for the sync API
    #[arg(long, env = "VAULT_SYNC_TOKEN", hide_env_values = true)]
    token: String,

    /// Remote vault name (defaults to the folder name)
    #[arg(long, env = "VAULT_SYNC_VAULT_NAME")]
    vault_name: Option<String>,

    /// JSON file with sync settings; missing fields use defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Name this device registers under
    #[arg(long)]
    device_name: Option<String>,

    /// Ask the service to index synced notes for semantic search
    #[arg(long)]
    vectorize: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => SyncConfig::default(),
    };
    if let Some(name) = &args.device_name {
        config.device_name = name.clone();
    }
    if args.vectorize {
        config.vectorize_enabled = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info,sync_daemon=info,sync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args)?;
    let vault_path = args
        .vault
        .canonicalize()
        .with_context(|| format!("Vault path {} is not accessible", args.vault.display()))?;
    let vault_name = match &args.vault_name {
        Some(name) => name.clone(),
        None => vault_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("Cannot derive a vault name from the path; pass --vault-name")?,
    };

    info!("Starting sync-daemon");
    info!("Vault path: {:?}", vault_path);
    info!("Server: {}", args.server);

    let events = Arc::new(EventBus::new());
    let _event_log = events.subscribe(|event| match event {
        SyncEvent::ConflictCreated { path, conflict_path, .. } => {
            warn!("Conflict on {}: remote version saved as {}", path, conflict_path);
        }
        SyncEvent::BindingAbandoned { vault_name, reason, .. } => {
            warn!("Could not bind vault {}: {}", vault_name, reason);
        }
        _ => {}
    });

    let fs = Arc::new(NativeFs::new(vault_path.clone()));
    let remote = Arc::new(HttpRemote::new(&args.server, args.token.clone())?);

    let session = VaultSession::start(
        fs,
        Arc::clone(&remote),
        remote,
        &vault_name,
        &vault_path.to_string_lossy(),
        config,
        Arc::clone(&events),
        Arc::new(LogReindexSink),
    )
    .await?;
    info!("Bound to remote vault {}", session.binding().vault_id);

    let mut watcher = FileWatcher::new(vault_path, WATCH_DEBOUNCE)?;
    info!("File watcher started");

    // Catch up on changes made while the daemon was down.
    session.sync_soon();

    info!("Daemon running. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                session.on_file_event(&event);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.shutdown().await;
    info!("Shutting down");
    Ok(())
}
