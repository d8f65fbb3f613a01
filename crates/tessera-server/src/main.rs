mod ipc;
mod server_state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tessera_core::{SqliteStore, SystemClock, TrustConfig, TrustServices};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use server_state::ServerState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Command-line arguments for the trust daemon.
struct Args {
    socket_path: String,
    db_path: String,
    config_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut socket_path = String::new();
    let mut db_path = String::new();
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => socket_path = args.next().unwrap_or_default(),
            "--db" => db_path = args.next().unwrap_or_default(),
            "--config" => config_path = args.next().map(PathBuf::from),
            other => tracing::warn!(arg = %other, "ignoring unknown argument"),
        }
    }

    if socket_path.is_empty() {
        socket_path = default_socket_path();
    }
    if db_path.is_empty() {
        db_path = dirs_fallback("tessera-server/trust.db");
    }

    Args {
        socket_path,
        db_path,
        config_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("tessera-server starting");

    let args = parse_args();

    let config = match &args.config_path {
        Some(path) => TrustConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrustConfig::default(),
    };

    if let Some(parent) = Path::new(&args.db_path).parent() {
        std::fs::create_dir_all(parent).context("failed to create db dir")?;
    }
    let store = SqliteStore::open(Path::new(&args.db_path))
        .with_context(|| format!("failed to open trust database at {}", args.db_path))?;

    let clock = Arc::new(SystemClock);
    let services = TrustServices::new(Arc::new(store), config, clock.clone());
    let state = Arc::new(ServerState::new(services, clock));

    // Start the IPC listener
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let ipc_state = Arc::clone(&state);
    let socket = args.socket_path.clone();
    tokio::spawn(async move {
        ipc::start_ipc_listener(&socket, ipc_state, shutdown_tx).await;
    });

    // Drop idle rate-limit windows
    let sweep_state = Arc::clone(&state);
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_state.services.limiters.sweep();
        }
    });

    tracing::info!(socket = %args.socket_path, db = %args.db_path, "tessera-server ready");

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
        }
    }

    tracing::info!("tessera-server shutting down");
    sweeper.abort();

    // Clean up socket file
    let _ = std::fs::remove_file(&args.socket_path);

    tracing::info!("tessera-server stopped");
    Ok(())
}

fn dirs_fallback(subpath: &str) -> String {
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{base}/.local/share/{subpath}")
}

fn default_socket_path() -> String {
    let tmp = std::env::temp_dir();
    tmp.join("tessera-server.sock")
        .to_string_lossy()
        .to_string()
}
