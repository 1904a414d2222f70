//! rtsyncd
//!
//! Runs the reconciliation engine against a store until told to stop.
//!
//! # Administrative commands
//!
//! Over the control socket, one per line:
//!
//! - `exit` - Shut the daemon down
//! - `dump` - Print the last pass report, engine statistics, bridge state
//!   and runtime state as JSON

mod control;
mod error;
mod pidfile;
mod settings;

use clap::Parser;
use control::{ControlContext, SocketGuard};
use error::DaemonResult;
use parking_lot::RwLock;
use pidfile::Pidfile;
use rtsync_engine::runtime::MemoryRuntime;
use rtsync_engine::{EventLoopBridge, ReconcilerContext, StatusBoard};
use rtsync_store::{SeedDocument, StoreClient};
use settings::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Keeps the routing runtime in step with the configuration store.
#[derive(Parser)]
#[command(name = "rtsyncd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store endpoint (a JSON seed document for the bundled store)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Unix socket for administrative commands
    #[arg(short, long)]
    control_socket: Option<PathBuf>,

    /// Pidfile to lock while running
    #[arg(short, long)]
    pidfile: Option<PathBuf>,

    /// JSON settings file
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG overrides the verbosity flag.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.overlay(cli.database, cli.control_socket, cli.pidfile);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(settings))?;
    Ok(())
}

async fn run(settings: Settings) -> DaemonResult<()> {
    let pidfile = settings.pidfile.as_deref().map(Pidfile::acquire).transpose()?;
    if let Some(pidfile) = &pidfile {
        info!(path = %pidfile.path().display(), "pidfile acquired");
    }

    let database = settings.database()?;
    let store = Arc::new(SeedDocument::load(database)?.into_store()?);
    if settings.notifier {
        store.enable_notifier()?;
    }
    store.set_poll_interval(settings.poll_interval());
    let store: Arc<dyn StoreClient> = store;

    let context = ReconcilerContext::new(settings.engine_config(), store, MemoryRuntime::new());
    let board: StatusBoard = Arc::new(RwLock::new(context.dump()));
    let mut bridge = EventLoopBridge::new(context).with_status_board(Arc::clone(&board));

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let shutdown_tx = Arc::new(shutdown_tx);

    let _socket = match &settings.control_socket {
        Some(path) => {
            let listener = control::bind(path)?;
            let context = ControlContext::new(Arc::clone(&board), Arc::clone(&shutdown_tx));
            tokio::spawn(control::serve(listener, context));
            info!(path = %path.display(), "control socket listening");
            Some(SocketGuard(path.clone()))
        }
        None => None,
    };

    let signals = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "failed to install signal handlers");
            return;
        }
        signals.send_replace(());
    });

    info!(
        database = %database.display(),
        lock = %settings.lock_name,
        "rtsyncd ready"
    );
    bridge.run(shutdown_rx).await;

    info!(passes = bridge.context().stats().passes, "rtsyncd exiting");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    Ok(())
}
