//! Render worker process lifecycle.
//!
//! Spawns workers in their own process group, checks that they survive
//! start-up, and terminates them with SIGTERM -> grace period -> SIGKILL.
//! Surviving children are tracked by pid until they are terminated or reaped.
//!
//! Worker stderr goes to `worker-<port>.log` in the log directory rather than
//! a pipe, so a worker keeps running (and writing) after the process that
//! spawned it has exited.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use renderpool_core::config::PoolConfig;

/// Number of trailing log lines reported for a failed start.
const LOG_TAIL_LINES: usize = 50;

/// Poll interval when waiting on a process we do not own a handle for.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How workers are launched and stopped.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Worker executable. Resolved through `PATH` unless absolute.
    pub binary: PathBuf,
    /// Arguments placed before the port flag.
    pub extra_args: Vec<String>,
    /// Port flag, passed as `<flag>=<port>`.
    pub port_flag: String,
    /// Delay before the post-launch liveness check.
    pub liveness_delay: Duration,
    /// Wait after SIGTERM before escalating.
    pub graceful_timeout: Duration,
    /// Wait after SIGKILL before giving up.
    pub forceful_timeout: Duration,
    /// Directory receiving each worker's stderr.
    pub log_dir: PathBuf,
}

impl SupervisorOptions {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            binary: config.worker_binary.clone(),
            extra_args: config.worker_args.clone(),
            port_flag: config.port_flag.clone(),
            liveness_delay: config.liveness_check_delay(),
            graceful_timeout: config.graceful_timeout(),
            forceful_timeout: config.forceful_timeout(),
            log_dir: config.worker_log_dir(),
        }
    }

    /// The argument that tells a worker which port to listen on.
    pub fn port_arg(&self, port: u16) -> String {
        format!("{}={port}", self.port_flag)
    }

    /// Stderr log of the worker listening on `port`.
    pub fn log_path(&self, port: u16) -> PathBuf {
        self.log_dir.join(format!("worker-{port}.log"))
    }
}

/// Result of a termination attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process exited after being signalled.
    Exited,
    /// The process was already gone before any signal was delivered.
    AlreadyGone,
    /// The process survived SIGTERM and SIGKILL within the timeouts.
    StillRunning,
}

impl TerminateOutcome {
    pub const fn is_gone(self) -> bool {
        matches!(self, Self::Exited | Self::AlreadyGone)
    }
}

/// A tracked worker whose exit was collected.
#[derive(Debug)]
pub struct ReapedWorker {
    pub pid: u32,
    pub port: u16,
    pub dataset_path: PathBuf,
    pub status: ExitStatus,
}

struct TrackedWorker {
    child: Child,
    port: u16,
    dataset_path: PathBuf,
}

/// Owns the OS side of the worker pool.
pub struct ProcessSupervisor {
    options: SupervisorOptions,
    /// Live children keyed by pid.
    tracked: RwLock<HashMap<u32, TrackedWorker>>,
}

impl ProcessSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        Self {
            options,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    pub const fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Launch a worker for `dataset_path` listening on `port`.
    ///
    /// Returns the worker pid once it has survived the liveness delay.
    pub async fn spawn(&self, dataset_path: &Path, port: u16) -> Result<u32, SupervisorError> {
        let is_dir = tokio::fs::metadata(dataset_path)
            .await
            .is_ok_and(|m| m.is_dir());
        if !is_dir {
            return Err(SupervisorError::DatasetMissing {
                path: dataset_path.display().to_string(),
            });
        }

        let log_path = self.options.log_path(port);
        let log = open_log(&self.options.log_dir, &log_path).await?;

        let mut cmd = Command::new(&self.options.binary);
        cmd.args(&self.options.extra_args)
            .arg(self.options.port_arg(port))
            .current_dir(dataset_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .process_group(0);

        info!(
            binary = %self.options.binary.display(),
            dataset = %dataset_path.display(),
            port,
            log = %log_path.display(),
            "Spawning render worker"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SupervisorError::BinaryNotFound {
                    binary: self.options.binary.display().to_string(),
                }
            } else {
                SupervisorError::Io(e)
            }
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::StartFailed {
            status: "unknown".to_string(),
            diagnostic: "worker exited before its pid could be read".to_string(),
        })?;

        tokio::time::sleep(self.options.liveness_delay).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let diagnostic = read_log_tail(&log_path).await;
                warn!(pid, port, %status, diagnostic = %diagnostic, "Worker exited during start-up");
                return Err(SupervisorError::StartFailed {
                    status: status.to_string(),
                    diagnostic,
                });
            }
            Err(e) => {
                error!(pid, port, error = %e, "Failed to poll freshly spawned worker");
                let _ = child.start_kill();
                return Err(SupervisorError::Io(e));
            }
        }

        self.tracked.write().await.insert(
            pid,
            TrackedWorker {
                child,
                port,
                dataset_path: dataset_path.to_path_buf(),
            },
        );

        info!(pid, port, "Render worker started");
        Ok(pid)
    }

    /// Stop the worker with `pid` and its process group.
    ///
    /// A process that is already gone counts as success.
    pub async fn terminate(&self, pid: u32) -> Result<TerminateOutcome, SupervisorError> {
        let target = to_pid(pid)?;
        let mut tracked = self.tracked.write().await.remove(&pid);

        if let Some(worker) = tracked.as_mut() {
            if let Ok(Some(status)) = worker.child.try_wait() {
                debug!(pid, %status, "Worker had already exited");
                return Ok(TerminateOutcome::AlreadyGone);
            }
        }

        debug!(pid, tracked = tracked.is_some(), "Terminating worker");

        match signal_group(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                if let Some(worker) = tracked.as_mut() {
                    let _ = worker.child.try_wait();
                }
                info!(pid, "Worker already gone");
                return Ok(TerminateOutcome::AlreadyGone);
            }
            Err(errno) => {
                self.restore(pid, tracked).await;
                return Err(SupervisorError::Signal { pid, errno });
            }
        }

        if wait_for_exit(tracked.as_mut(), target, self.options.graceful_timeout).await {
            info!(pid, "Worker exited gracefully");
            return Ok(TerminateOutcome::Exited);
        }

        warn!(
            pid,
            timeout_ms = self.options.graceful_timeout.as_millis(),
            "Timeout waiting for graceful shutdown, killing"
        );

        match signal_group(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => {
                self.restore(pid, tracked).await;
                return Err(SupervisorError::Signal { pid, errno });
            }
        }

        if wait_for_exit(tracked.as_mut(), target, self.options.forceful_timeout).await {
            info!(pid, "Worker killed");
            return Ok(TerminateOutcome::Exited);
        }

        error!(pid, "Worker survived SIGKILL");
        self.restore(pid, tracked).await;
        Ok(TerminateOutcome::StillRunning)
    }

    /// Collect every tracked child that has exited, without blocking.
    pub async fn collect_exited(&self) -> Vec<ReapedWorker> {
        let mut reaped = Vec::new();
        self.tracked
            .write()
            .await
            .retain(|&pid, worker| match worker.child.try_wait() {
                Ok(Some(status)) => {
                    reaped.push(ReapedWorker {
                        pid,
                        port: worker.port,
                        dataset_path: worker.dataset_path.clone(),
                        status,
                    });
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "Failed to poll worker status");
                    true
                }
            });
        reaped
    }

    /// Number of children currently tracked.
    pub async fn tracked_count(&self) -> usize {
        self.tracked.read().await.len()
    }

    pub async fn is_tracked(&self, pid: u32) -> bool {
        self.tracked.read().await.contains_key(&pid)
    }

    async fn restore(&self, pid: u32, tracked: Option<TrackedWorker>) {
        if let Some(worker) = tracked {
            self.tracked.write().await.insert(pid, worker);
        }
    }
}

/// Whether any process with `pid` exists (including ones we may not signal).
pub fn process_exists(pid: u32) -> bool {
    let Ok(target) = to_pid(pid) else {
        return false;
    };
    !matches!(kill(target, None::<Signal>), Err(Errno::ESRCH))
}

fn to_pid(pid: u32) -> Result<Pid, SupervisorError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(SupervisorError::InvalidPid { pid }),
    }
}

/// Signal the process group led by `pid`, falling back to the single process
/// when it is not a group leader.
fn signal_group(pid: Pid, signal: Signal) -> Result<(), Errno> {
    match killpg(pid, signal) {
        Err(Errno::ESRCH) => kill(pid, signal),
        other => other,
    }
}

async fn wait_for_exit(tracked: Option<&mut TrackedWorker>, pid: Pid, limit: Duration) -> bool {
    if let Some(worker) = tracked {
        return match tokio::time::timeout(limit, worker.child.wait()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(pid = pid.as_raw(), error = %e, "Error waiting for worker");
                !matches!(kill(pid, None::<Signal>), Ok(()))
            }
            Err(_) => false,
        };
    }

    let deadline = Instant::now() + limit;
    loop {
        if matches!(kill(pid, None::<Signal>), Err(Errno::ESRCH)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

async fn open_log(dir: &Path, path: &Path) -> Result<std::fs::File, SupervisorError> {
    tokio::fs::create_dir_all(dir).await?;
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}

/// Last lines of a worker log, for start-up diagnostics.
async fn read_log_tail(path: &Path) -> String {
    let text = match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Worker log unreadable");
            String::new()
        }
    };
    let lines: Vec<&str> = text.lines().collect();
    let tail = lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n");
    if tail.trim().is_empty() {
        "worker exited without writing to stderr".to_string()
    } else {
        tail
    }
}

/// Errors from worker process operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Worker binary not found: {binary}")]
    BinaryNotFound { binary: String },

    #[error("Dataset directory does not exist: {path}")]
    DatasetMissing { path: String },

    #[error("Worker exited during start-up ({status})")]
    StartFailed { status: String, diagnostic: String },

    #[error("Failed to signal process {pid}: {errno}")]
    Signal { pid: u32, errno: Errno },

    #[error("Invalid process id: {pid}")]
    InvalidPid { pid: u32 },

    #[error("Process I/O error: {0}")]
    Io(#[from] std::io::Error),
}
