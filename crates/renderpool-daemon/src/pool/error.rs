//! Service-level errors returned by the pool manager.

use super::lock::LockError;
use crate::ports::PortError;
use crate::storage::DatabaseError;
use crate::supervisor::SupervisorError;

/// Errors surfaced to callers of [`PoolManager`](super::PoolManager).
///
/// Primary messages never carry raw OS output; start-up diagnostics travel in
/// [`PoolError::ProcessStart::diagnostic`] and in the job's `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("No free port in range {start}-{end}")]
    PortExhaustion { start: u16, end: u16 },

    #[error("Concurrency limit reached ({running}/{max} workers running)")]
    ConcurrencyLimit { running: i64, max: u32 },

    #[error("Worker binary not found: {binary}")]
    BinaryNotFound { binary: String },

    #[error("Worker failed to start for dataset {dataset}")]
    ProcessStart { dataset: String, diagnostic: String },

    #[error("Failed to stop worker on port {port} (pid {pid}): {}", termination_note(.still_running))]
    TerminateFailed {
        port: u16,
        pid: u32,
        still_running: bool,
    },

    #[error("Job {job_id} is already bound to a running worker for {dataset_path}")]
    JobAlreadyBound {
        job_id: String,
        dataset_path: String,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Record store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Pool lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Worker supervisor error: {0}")]
    Supervisor(SupervisorError),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn termination_note(still_running: &bool) -> &'static str {
    if *still_running {
        "the process may still be running"
    } else {
        "the process is gone"
    }
}

impl PoolError {
    /// Map a spawn failure onto the service taxonomy.
    pub fn from_spawn(err: SupervisorError, dataset: &str) -> Self {
        match err {
            SupervisorError::BinaryNotFound { binary } => Self::BinaryNotFound { binary },
            SupervisorError::StartFailed { status, diagnostic } => Self::ProcessStart {
                dataset: dataset.to_string(),
                diagnostic: format!("{status}: {diagnostic}"),
            },
            err @ SupervisorError::DatasetMissing { .. } => Self::ProcessStart {
                dataset: dataset.to_string(),
                diagnostic: err.to_string(),
            },
            other => Self::Supervisor(other),
        }
    }

    /// Stable machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PortInUse { .. } => "port_in_use",
            Self::PortExhaustion { .. } => "port_exhaustion",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::BinaryNotFound { .. } => "binary_not_found",
            Self::ProcessStart { .. } => "process_start",
            Self::TerminateFailed { .. } => "terminate_failed",
            Self::JobAlreadyBound { .. } => "job_already_bound",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Database(_) => "record_store",
            Self::Lock(_) => "pool_lock",
            Self::Supervisor(_) => "supervisor",
        }
    }

    /// Full text for troubleshooting, including any captured diagnostic.
    pub fn detail(&self) -> String {
        match self {
            Self::ProcessStart { diagnostic, .. } => format!("{self}: {diagnostic}"),
            _ => self.to_string(),
        }
    }
}

impl From<PortError> for PoolError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::InUse { port } => Self::PortInUse { port },
        }
    }
}
