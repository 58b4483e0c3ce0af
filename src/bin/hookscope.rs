//! hookscope - headless runner for the hook event ingestion core
//!
//! # Usage
//!
//! ```bash
//! # Follow the broker and log what arrives
//! hookscope watch
//!
//! # Same, mirroring events into the durable store
//! hookscope watch --persistence true
//!
//! # Show the effective configuration (file + HOOKSCOPE_* overrides)
//! hookscope config
//!
//! # Delete every stored event
//! hookscope clear-store
//!
//! # Enable debug logging
//! RUST_LOG=hookscope_client=debug hookscope watch
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: disconnect and exit

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hookscope_client::{EventStore, HealthStatus, HookscopeConfig, HookscopeCore};

/// hookscope - Claude Code hook event monitor
#[derive(Parser, Debug)]
#[command(name = "hookscope", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/hookscope/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to the state directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the broker and log events, connection and health changes
    Watch {
        /// Turn durable mirroring on or off (remembered for later runs)
        #[arg(long, value_name = "BOOL")]
        persistence: Option<bool>,
    },
    /// Print the effective configuration
    Config,
    /// Delete every event in the durable store
    ClearStore,
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("hookscope")
        .join("hookscope.log")
}

fn init_logging(to_file: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("hookscope=info".parse()?)
        .add_directive("hookscope_client=info".parse()?)
        .add_directive("hookscope_protocol=info".parse()?)
        .add_directive("hookscope_core=info".parse()?);

    if to_file {
        let path = log_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let file = File::create(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_file)?;

    let config = HookscopeConfig::load(args.config.as_deref()).context("Failed to load config")?;

    match args.command.unwrap_or(Command::Watch { persistence: None }) {
        Command::Watch { persistence } => run_watch(config, persistence),
        Command::Config => print_config(&config),
        Command::ClearStore => clear_store(&config),
    }
}

fn print_config(config: &HookscopeConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.channel.password.is_some() {
        shown.channel.password = Some("<redacted>".to_string());
    }
    if shown.persistence.database_path.is_none() {
        shown.persistence.database_path = Some(config.persistence.resolved_database_path());
    }
    let rendered = toml::to_string_pretty(&shown).context("Failed to render config")?;
    print!("{rendered}");
    Ok(())
}

fn clear_store(config: &HookscopeConfig) -> Result<()> {
    let path = config.persistence.resolved_database_path();
    let store = EventStore::open(&path)
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    let removed = store.clear().context("Failed to clear store")?;
    println!("Removed {removed} stored events from {}", path.display());
    Ok(())
}

/// Runs the core until a shutdown signal (async entry point).
#[tokio::main]
async fn run_watch(config: HookscopeConfig, persistence: Option<bool>) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.channel.address(),
        topic = %config.channel.topic,
        tls = config.channel.tls,
        "hookscope starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let core = Arc::new(HookscopeCore::start_default(config).await);
    if let Some(enabled) = persistence {
        core.set_persistence_enabled(enabled)
            .await
            .context("Failed to change persistence")?;
    }

    let connector = Arc::clone(&core);
    tokio::spawn(async move {
        if let Err(e) = connector.connect().await {
            warn!(error = %e, "Initial connection failed, retrying");
            if let Err(e) = connector.reconnect().await {
                error!(error = %e, "Could not reach the broker");
            }
        }
    });

    let mut snapshots = core.subscribe_snapshots();
    let mut connection = core.subscribe_connection();
    let mut reconnection = core.subscribe_reconnection();
    let mut performance = core.subscribe_performance();
    let mut last_health: Option<HealthStatus> = None;
    let mut newest_seen = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => break,

            Ok(()) = connection.changed() => {
                let state = connection.borrow_and_update().clone();
                info!(state = %state, "Connection state changed");
            }

            Ok(()) = reconnection.changed() => {
                let state = *reconnection.borrow_and_update();
                info!(state = %state, "Reconnection state changed");
            }

            Ok(()) = snapshots.changed() => {
                let snapshot = snapshots.borrow_and_update().clone();
                let Some(newest) = snapshot.first() else { continue };
                if newest_seen.as_ref() == Some(newest.id()) {
                    continue;
                }
                newest_seen = Some(newest.id().clone());
                info!(
                    cached = snapshot.len(),
                    event_id = %newest.id(),
                    hook_type = newest.category().as_hook_type(),
                    severity = %newest.severity(),
                    session = newest.session_id().map(|s| s.short()).unwrap_or("-"),
                    title = newest.title(),
                    "Hook event"
                );
            }

            Ok(()) = performance.changed() => {
                let Some(sample) = performance.borrow_and_update().clone() else { continue };
                debug!(
                    eps = sample.events_per_second,
                    latency_ms = sample.connection_latency_ms,
                    memory_percent = sample.memory_usage_percent,
                    score = sample.health_score,
                    "Performance sample"
                );
                if last_health != Some(sample.health) {
                    last_health = Some(sample.health);
                    info!(health = ?sample.health, score = sample.health_score, "Health changed");
                }
            }

            else => break,
        }
    }

    core.shutdown().await;
    let stats = core.cache_stats();
    info!(
        inserted = stats.inserted,
        replaced = stats.replaced,
        evicted = stats.evicted,
        purged = stats.purged,
        "hookscope stopped"
    );
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
