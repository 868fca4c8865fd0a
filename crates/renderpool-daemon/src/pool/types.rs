//! Service views returned by the pool manager.

use serde::Serialize;

use crate::storage::{WorkerRecord, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureStatus {
    Started,
    Reused,
}

/// Result of [`ensure_worker`](super::PoolManager::ensure_worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureOutcome {
    pub status: EnsureStatus,
    pub port: u16,
    pub pid: u32,
    pub connection_string: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStatus {
    /// The worker was signalled and exited.
    Stopped,
    /// The worker had already exited; its rows were cleaned up.
    AlreadyGone,
    /// Nothing was running on the port.
    NotRunning,
}

/// Result of [`stop_worker`](super::PoolManager::stop_worker). Every status
/// counts as success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub port: u16,
    pub status: StopStatus,
    pub message: String,
}

impl StopOutcome {
    pub(crate) fn new(port: u16, status: StopStatus) -> Self {
        let message = match status {
            StopStatus::Stopped => format!("Worker on port {port} stopped"),
            StopStatus::AlreadyGone => {
                format!("Worker on port {port} was already gone; record marked stopped")
            }
            StopStatus::NotRunning => format!("No running worker on port {port}"),
        };
        Self {
            port,
            status,
            message,
        }
    }
}

/// A worker record as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub job_id: String,
    pub dataset_path: String,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: i64,
    pub last_activity: i64,
    pub error_message: Option<String>,
    /// `host:port`, only for running workers.
    pub connection_string: Option<String>,
}

impl WorkerView {
    pub fn from_record(record: WorkerRecord, host: &str) -> Self {
        let status = record.worker_status();
        let port = record.port.and_then(|p| u16::try_from(p).ok());
        let connection_string = match (status, port) {
            (WorkerStatus::Running, Some(port)) => Some(format!("{host}:{port}")),
            _ => None,
        };

        Self {
            port,
            pid: record.pid.and_then(|p| u32::try_from(p).ok()),
            status,
            connection_string,
            job_id: record.job_id,
            dataset_path: record.dataset_path,
            started_at: record.started_at,
            last_activity: record.last_activity,
            error_message: record.error_message,
        }
    }
}

/// Result of [`list_workers`](super::PoolManager::list_workers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerListing {
    pub workers: Vec<WorkerView>,
    pub total_count: usize,
    pub port_range: (u16, u16),
    pub available_port_count: usize,
    pub max_concurrent: u32,
}

/// Whether a single port could be bound right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortCheck {
    pub port: u16,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
