//! `renderpool` supervisor
//!
//! Runs the render worker pool as a long-lived service (`serve`) and exposes
//! the pool operations as one-shot subcommands that print JSON on stdout.
//! Subcommands talk to `serve` over its control socket; when no supervisor is
//! listening, everything except `ensure` runs directly against the database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, warn};

use renderpool_core::config::{Config, load_config, lock_path};
use renderpool_daemon::control::{
    ControlRequest, ControlResponse, dispatch, send_request, spawn_control_server,
};
use renderpool_daemon::pool::{PoolManager, check_port, spawn_inactivity_sweeper};
use renderpool_daemon::storage::Database;
use renderpool_daemon::supervisor::spawn_child_reaper;

#[derive(Parser, Debug)]
#[command(name = "renderpool")]
#[command(version, about = "renderpool - render worker pool supervisor")]
struct Args {
    /// Configuration file (JSON), layered over the global settings file
    #[arg(long, global = true, env = "RENDERPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, global = true, env = "RENDERPOOL_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Control socket of the running supervisor
    #[arg(long, global = true, env = "RENDERPOOL_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true, env = "RENDERPOOL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, global = true, env = "RENDERPOOL_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervisor until Ctrl+C or SIGTERM
    Serve {
        /// Stop every running worker before exiting
        #[arg(long)]
        stop_on_exit: bool,
    },
    /// Get a worker for a dataset, starting one if needed.
    ///
    /// Requires a running `serve`, which becomes the worker's parent.
    Ensure {
        /// Dataset directory the worker runs in
        #[arg(long)]
        dataset: PathBuf,
        /// Job identifier (defaults to a fresh UUID)
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Stop the worker listening on a port
    Stop {
        #[arg(long)]
        port: u16,
    },
    /// List running workers and pool capacity
    List,
    /// Show the record for one job
    Info {
        #[arg(long)]
        job_id: String,
    },
    /// Stop workers idle longer than the threshold
    Sweep {
        /// Threshold in hours (defaults to the configured value)
        #[arg(long)]
        hours: Option<f64>,
    },
    /// Delete stopped/error records older than the given age
    Purge {
        #[arg(long)]
        days: f64,
    },
    /// Check whether a port can be bound right now
    CheckPort {
        #[arg(long)]
        port: u16,
    },
}

#[derive(Serialize)]
struct ErrorDocument<'a> {
    error: &'a str,
    message: &'a str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(path) = &args.db_path {
        config.daemon.database_path = Some(path.clone());
    }
    if let Some(path) = &args.socket {
        config.daemon.control_socket = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    config.daemon.log_json |= args.log_json;

    let log_filter = format!("renderpool_daemon={}", config.daemon.log_level);
    renderpool_core::tracing_init::init_tracing(&log_filter, config.daemon.log_json);

    let request = match args.command {
        Command::CheckPort { port } => return print_json(&check_port(port)),
        Command::Serve { stop_on_exit } => {
            let (config, manager) = open_manager(config).await?;
            return serve(manager, &config, stop_on_exit).await;
        }
        Command::Ensure { dataset, job_id } => ControlRequest::Ensure {
            job_id: job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            // The supervisor resolves paths against its own working directory.
            dataset_path: std::path::absolute(&dataset)
                .context("Invalid dataset path")?
                .to_string_lossy()
                .into_owned(),
        },
        Command::Stop { port } => ControlRequest::Stop { port },
        Command::List => ControlRequest::List,
        Command::Info { job_id } => ControlRequest::Info { job_id },
        Command::Sweep { hours } => ControlRequest::Sweep {
            threshold_hours: hours,
        },
        Command::Purge { days } => ControlRequest::Purge {
            older_than_days: days,
        },
    };

    let db_path = resolve_database_path(&config)?;
    config.resolve_paths(&db_path);
    let socket = control_socket(&config)?;

    match send_request(&socket, &request).await {
        Ok(response) => report(response),
        Err(e) if e.is_unavailable() => {
            if matches!(request, ControlRequest::Ensure { .. }) {
                return report(ControlResponse::error(
                    "supervisor_unavailable",
                    format!(
                        "No supervisor is listening on {}; start `renderpool serve` first",
                        socket.display()
                    ),
                ));
            }
            debug!(socket = %socket.display(), "No supervisor listening, running locally");
            let (_, manager) = open_manager(config).await?;
            report(dispatch(&manager, request).await)
        }
        Err(e) => Err(e).context("Control request failed"),
    }
}

async fn serve(manager: Arc<PoolManager>, config: &Config, stop_on_exit: bool) -> anyhow::Result<()> {
    let socket = control_socket(config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port_start = config.pool.port_range_start,
        port_end = config.pool.port_range_end,
        max_concurrent = config.pool.max_concurrent,
        binary = %config.pool.worker_binary.display(),
        socket = %socket.display(),
        "Starting renderpool supervisor"
    );

    let corrected = manager.recover().await?;
    if !corrected.is_empty() {
        warn!(count = corrected.len(), "Startup recovery demoted stale records");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reaper_handle = spawn_child_reaper(Arc::clone(&manager), shutdown_rx.clone())
        .context("Failed to register child exit notifications")?;
    let sweeper_handle = spawn_inactivity_sweeper(
        Arc::clone(&manager),
        Duration::from_secs(config.pool.sweep_interval_secs),
        config.pool.inactivity_threshold_hours,
        shutdown_rx.clone(),
    );
    let control_handle = spawn_control_server(Arc::clone(&manager), &socket, shutdown_rx)
        .context("Failed to open control socket")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so workers don't inherit it.
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;
    info!("Supervisor ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = control_handle.await;
    let _ = reaper_handle.await;
    let _ = sweeper_handle.await;

    if stop_on_exit {
        let stopped = manager.stop_all().await?;
        info!(count = stopped.len(), "Stopped workers on exit");
    }

    info!("Supervisor stopped");
    Ok(())
}

/// Open the database and build a manager that shares the cross-process lock
/// next to it.
async fn open_manager(mut config: Config) -> anyhow::Result<(Config, Arc<PoolManager>)> {
    let path = resolve_database_path(&config)?;
    config.resolve_paths(&path);

    info!(path = %path.display(), "Opening database");
    let db = Database::open(&path).await?;
    let manager = PoolManager::new(config.pool.clone(), db).with_lock_file(lock_path(&path));
    Ok((config, Arc::new(manager)))
}

fn resolve_database_path(config: &Config) -> anyhow::Result<PathBuf> {
    match config.database_path() {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

fn control_socket(config: &Config) -> anyhow::Result<PathBuf> {
    config
        .daemon
        .control_socket
        .clone()
        .ok_or_else(|| anyhow::anyhow!("Control socket path is not resolved"))
}

/// Fallback database path: ~/.renderpool/workers.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".renderpool").join("workers.db"))
}

/// Print a successful result, or an error document followed by a failing
/// exit.
fn report(response: ControlResponse) -> anyhow::Result<()> {
    match response {
        ControlResponse::Ok { result } => print_json(&result),
        ControlResponse::Error { error, message } => {
            print_json(&ErrorDocument {
                error: &error,
                message: &message,
            })?;
            Err(anyhow::anyhow!("{error}: {message}"))
        }
    }
}

#[allow(clippy::print_stdout)]
fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
