//! Database models for the render worker pool.

use serde::{Deserialize, Serialize};

/// Worker record from the database.
///
/// `port` and `pid` are only `None` for rows that never got a worker, i.e.
/// admission or spawn failures recorded with status `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    pub job_id: String,
    pub dataset_path: String,
    pub port: Option<i64>,
    pub pid: Option<i64>,
    pub status: String,
    pub started_at: i64,
    pub last_activity: i64,
    pub error_message: Option<String>,
}

impl WorkerRecord {
    /// Parsed status; unknown strings are treated as `Error`.
    pub fn worker_status(&self) -> WorkerStatus {
        self.status.parse().unwrap_or(WorkerStatus::Error)
    }

    pub fn is_running(&self) -> bool {
        self.worker_status() == WorkerStatus::Running
    }

    /// The `(pid, port)` pair identifying the worker this row is bound to.
    pub fn endpoint(&self) -> Option<(u32, u16)> {
        let pid = u32::try_from(self.pid?).ok()?;
        let port = u16::try_from(self.port?).ok()?;
        Some((pid, port))
    }
}

/// Worker status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}
