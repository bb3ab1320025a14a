//! CLI entry point for the Toxic-MD session keeper.
//!
//! This binary provides the `toxic` command with subcommands for running
//! the bot, printing the effective configuration, and initializing the
//! data directories.

mod gateway;
mod helpers;
mod runtime_config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;
use tracing::{info, warn};

use toxic_kernel::{MemorySampler, Orchestrator, ProcessMemory, Transport};
use toxic_store::{ConfigStore, DocumentBackend, JsonFileBackend, SqliteBackend, WriteStatus};
use toxic_web::{AppState, WebServer};

use crate::gateway::GatewayTransport;
use crate::helpers::{init_tracing, shutdown_signal};
use crate::runtime_config::{RuntimeConfig, StoreBackend, StoreConfig};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Toxic-MD: keeps one messaging session alive and serves its settings.
#[derive(Parser)]
#[command(
    name = "toxic",
    version,
    about = "Toxic-MD session keeper",
    long_about = "Keeps a single messaging-gateway session connected, reconnecting with \
                  classified backoff, and serves cached bot settings."
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the gateway and keep the session alive.
    Run,

    /// Print the effective configuration as TOML.
    Config,

    /// Create the data and session directories and default documents.
    Init,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dotenv = dotenvy::dotenv();

    match cli.command {
        Commands::Run => init_tracing("info"),
        Commands::Config | Commands::Init => init_tracing("warn"),
    }
    match dotenv {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to load .env"),
    }

    match cli.command {
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Config => cmd_config(&cli.config),
        Commands::Init => cmd_init(&cli.config).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;
    info!(
        config = %config_path.display(),
        backend = ?config.store.backend,
        gateway = %config.gateway.url,
        "starting Toxic-MD"
    );

    // 1. Config store.
    let store = Arc::new(open_store(&config.store).await?);
    if store.initialize().await == WriteStatus::Failed {
        warn!("config store initialized with errors, continuing on defaults");
    }

    // 2. Transport.
    let transport = Arc::new(
        GatewayTransport::new(
            config.gateway.parsed_url()?,
            &config.gateway.session_dir,
            &config.store.data_dir,
        )
        .with_connect_timeout(Duration::from_secs(config.gateway.connect_timeout_secs)),
    );
    if let Err(e) = transport.restore_store().await {
        warn!(error = %e, "message store could not be restored, starting empty");
    }

    // 3. Lifecycle.
    let memory: Arc<dyn MemorySampler> = Arc::new(ProcessMemory);
    let orchestrator = Orchestrator::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&store),
        config.lifecycle_config(),
    )
    .with_memory_sampler(Arc::clone(&memory));
    let handle = orchestrator.handle();
    let lifecycle = tokio::spawn(orchestrator.run());

    // 4. HTTP liveness server.
    let state = AppState::from_handle(&config.gateway.bot_name, &handle, memory);
    let web = WebServer::new(config.web.clone(), state);
    let (web_stop, web_stopped) = oneshot::channel::<()>();
    let mut web_task = tokio::spawn(web.start(async {
        let _ = web_stopped.await;
    }));

    // 5. Wait for a signal, or for the web server to fail.
    let web_result = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut web_task => Some(result),
    };

    info!("shutting down");
    if handle.shutdown().is_err() {
        warn!("lifecycle loop already stopped");
    }
    lifecycle.await.context("lifecycle task panicked")?;

    let web_result = match web_result {
        Some(result) => result,
        None => {
            let _ = web_stop.send(());
            web_task.await
        }
    };

    if let Err(e) = transport.flush_store().await {
        warn!(error = %e, "final message store flush failed");
    }
    info!(caches = %store.cache_report(), "stopped");

    web_result
        .context("web server task panicked")?
        .context("web server failed")
}

// ---------------------------------------------------------------------------
// Subcommand: config
// ---------------------------------------------------------------------------

fn cmd_config(config_path: &Path) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    println!("# effective configuration ({})", config_path.display());
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: init
// ---------------------------------------------------------------------------

async fn cmd_init(config_path: &Path) -> Result<()> {
    let config = RuntimeConfig::load(config_path)?;

    println!();
    println!("  Toxic-MD Setup");
    println!("  ==============");
    println!();

    if config_path.exists() {
        println!("  [=] Config file already exists at {}", config_path.display());
    } else {
        if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(&RuntimeConfig::default())
            .context("failed to render default configuration")?;
        std::fs::write(config_path, rendered)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        println!("  [+] Wrote default config to {}", config_path.display());
    }

    let session_dir = &config.gateway.session_dir;
    std::fs::create_dir_all(session_dir)
        .with_context(|| format!("failed to create {}", session_dir.display()))?;
    println!("  [+] Session directory ready at {}", session_dir.display());

    let store = open_store(&config.store).await?;
    match store.initialize().await {
        WriteStatus::Persisted => println!("  [+] Default documents written"),
        WriteStatus::Unchanged => println!("  [=] Documents already up to date"),
        WriteStatus::Failed => {
            anyhow::bail!("failed to initialize documents in {}", config.store.data_dir.display())
        }
    }

    println!();
    println!("  Setup complete! Run `toxic run` to start.");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_store(config: &StoreConfig) -> Result<ConfigStore> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let backend: Arc<dyn DocumentBackend> = match config.backend {
        StoreBackend::Json => Arc::new(JsonFileBackend::new(&config.data_dir)),
        StoreBackend::Sqlite => {
            let path = config.sqlite_path();
            let backend = SqliteBackend::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Arc::new(backend)
        }
    };
    info!(backend = backend.name(), dir = %config.data_dir.display(), "store initialized");
    Ok(ConfigStore::new(backend, config.options()))
}
