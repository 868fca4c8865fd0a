//! Liveness reconciliation of persisted worker records.
//!
//! A `running` record is only trusted if its pid is a live process of the
//! worker binary whose arguments bind it to the recorded port. Records that
//! fail the check are demoted to `stopped` before anyone reads or counts them.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

use renderpool_core::config::PoolConfig;

use crate::storage::{Database, DatabaseError, WorkerRecord, WorkerStatus};

/// Message stored on records demoted by reconciliation.
pub const STALE_MESSAGE: &str = "process died or was reassigned";

/// Why a record's process does not check out. Internal: callers only ever see
/// the resulting `stopped` transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessValidationError {
    #[error("no such process")]
    NoSuchProcess,

    #[error("process is a zombie")]
    Zombie,

    #[error("process {name} is not the worker binary")]
    BinaryMismatch { name: String },

    #[error("process is not bound to port {expected}")]
    PortMismatch { expected: u16 },

    #[error("record has no pid/port")]
    MissingEndpoint,
}

/// Checks records against the OS process table.
pub struct LivenessReconciler {
    binary_name: OsString,
    port_flag: String,
    system: Mutex<System>,
}

impl LivenessReconciler {
    pub fn new(binary: &Path, port_flag: impl Into<String>) -> Self {
        let binary_name = binary
            .file_name()
            .map_or_else(|| binary.as_os_str().to_os_string(), OsStr::to_os_string);
        Self {
            binary_name,
            port_flag: port_flag.into(),
            system: Mutex::new(System::new()),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(&config.worker_binary, config.port_flag.clone())
    }

    /// True iff `pid` is a live worker process bound to `expected_port`
    /// (when given).
    pub fn validate(&self, pid: u32, expected_port: Option<u16>) -> bool {
        self.inspect(pid, expected_port).is_ok()
    }

    /// Detailed form of [`validate`](Self::validate).
    pub fn inspect(
        &self,
        pid: u32,
        expected_port: Option<u16>,
    ) -> Result<(), ProcessValidationError> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_exe(UpdateKind::Always),
        );

        let process = system
            .process(target)
            .ok_or(ProcessValidationError::NoSuchProcess)?;

        if matches!(process.status(), ProcessStatus::Zombie) {
            return Err(ProcessValidationError::Zombie);
        }

        let cmd = process.cmd();
        let name_matches = process.name() == self.binary_name.as_os_str()
            || process
                .exe()
                .and_then(Path::file_name)
                .is_some_and(|exe| exe == self.binary_name.as_os_str())
            // argv[0], or argv[1] for interpreter-launched workers
            || cmd
                .iter()
                .take(2)
                .any(|arg| Path::new(arg).file_name() == Some(self.binary_name.as_os_str()));
        if !name_matches {
            return Err(ProcessValidationError::BinaryMismatch {
                name: process.name().to_string_lossy().into_owned(),
            });
        }

        if let Some(port) = expected_port {
            if !args_bind_port(cmd, &self.port_flag, port) {
                return Err(ProcessValidationError::PortMismatch { expected: port });
            }
        }

        Ok(())
    }

    /// Demote every `running` record in `records` whose process fails
    /// validation. Returns the job ids that were corrected.
    pub async fn reconcile_stale(
        &self,
        db: &Database,
        records: &[WorkerRecord],
    ) -> Result<Vec<String>, DatabaseError> {
        let mut verdicts: HashMap<(u32, u16), Result<(), ProcessValidationError>> =
            HashMap::new();
        let mut corrected = Vec::new();

        for record in records.iter().filter(|r| r.is_running()) {
            let verdict = match record.endpoint() {
                Some((pid, port)) => verdicts
                    .entry((pid, port))
                    .or_insert_with(|| self.inspect(pid, Some(port)))
                    .clone(),
                None => Err(ProcessValidationError::MissingEndpoint),
            };

            let Err(reason) = verdict else {
                continue;
            };

            let message = format!("{STALE_MESSAGE} ({reason})");
            if db
                .update_status(&record.job_id, WorkerStatus::Stopped, Some(&message))
                .await?
            {
                warn!(
                    job_id = %record.job_id,
                    pid = ?record.pid,
                    port = ?record.port,
                    reason = %reason,
                    "Demoted stale worker record"
                );
                corrected.push(record.job_id.clone());
            }
        }

        if !corrected.is_empty() {
            debug!(count = corrected.len(), "Reconciliation pass corrected records");
        }
        Ok(corrected)
    }
}

/// Whether `args` carry `<flag>=<port>` or `<flag> <port>`.
fn args_bind_port(args: &[OsString], flag: &str, port: u16) -> bool {
    let joined = format!("{flag}={port}");
    let port_text = port.to_string();
    args.iter().enumerate().any(|(i, arg)| {
        arg.as_os_str() == OsStr::new(&joined)
            || (arg.as_os_str() == OsStr::new(flag)
                && args
                    .get(i + 1)
                    .is_some_and(|next| next.as_os_str() == OsStr::new(&port_text)))
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::process::{Child, Command};
    use std::time::Duration;

    const LOOP: &str = "while :; do sleep 1; done";

    fn spawn_sh(script: &str, port: u16) -> Child {
        let port_arg = format!("--server-port={port}");
        Command::new("sh")
            .args(["-c", script, "pvserver", port_arg.as_str()])
            .spawn()
            .unwrap()
    }

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn port_arguments_in_both_forms() {
        assert!(args_bind_port(
            &os(&["pvserver", "--server-port=11111"]),
            "--server-port",
            11111
        ));
        assert!(args_bind_port(
            &os(&["pvserver", "--server-port", "11111"]),
            "--server-port",
            11111
        ));
        assert!(!args_bind_port(
            &os(&["pvserver", "--server-port=111110"]),
            "--server-port",
            11111
        ));
        assert!(!args_bind_port(&os(&["pvserver", "--server-port"]), "--server-port", 11111));
    }

    #[test]
    fn live_worker_validates_against_its_port() {
        let reconciler = LivenessReconciler::new(Path::new("/bin/sh"), "--server-port");
        let mut child = spawn_sh(LOOP, 41_001);
        let pid = child.id();

        assert!(reconciler.validate(pid, Some(41_001)));
        assert!(reconciler.validate(pid, None));
        assert_eq!(
            reconciler.inspect(pid, Some(41_002)),
            Err(ProcessValidationError::PortMismatch { expected: 41_002 })
        );

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!reconciler.validate(pid, Some(41_001)));
    }

    #[test]
    fn other_binary_is_rejected() {
        let reconciler = LivenessReconciler::new(Path::new("pvserver"), "--server-port");
        let mut child = spawn_sh(LOOP, 41_003);

        let verdict = reconciler.inspect(child.id(), Some(41_003));
        assert!(
            matches!(verdict, Err(ProcessValidationError::BinaryMismatch { .. })),
            "{verdict:?}"
        );

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn unreaped_child_is_not_alive() {
        let reconciler = LivenessReconciler::new(Path::new("sh"), "--server-port");
        let mut child = spawn_sh("exit 0", 41_004);
        std::thread::sleep(Duration::from_millis(300));

        assert!(!reconciler.validate(child.id(), Some(41_004)));
        child.wait().unwrap();
    }

    #[test]
    fn nonexistent_pid_fails() {
        let reconciler = LivenessReconciler::new(Path::new("sh"), "--server-port");
        #[allow(clippy::cast_sign_loss)]
        let pid = i32::MAX as u32;
        assert_eq!(
            reconciler.inspect(pid, Some(1)),
            Err(ProcessValidationError::NoSuchProcess)
        );
    }

    #[tokio::test]
    async fn reconcile_demotes_only_dead_records() {
        let db = Database::open_in_memory().await.unwrap();
        let reconciler = LivenessReconciler::new(Path::new("sh"), "--server-port");
        let mut child = spawn_sh(LOOP, 41_005);

        #[allow(clippy::cast_sign_loss)]
        let dead_pid = i32::MAX as u32;
        db.insert_running("alive", "/data/a", 41_005, child.id())
            .await
            .unwrap();
        db.insert_running("dead-1", "/data/b", 41_006, dead_pid)
            .await
            .unwrap();
        db.insert_running("dead-2", "/data/b", 41_006, dead_pid)
            .await
            .unwrap();
        db.record_error("failed", "/data/c", "boom").await.unwrap();

        let records = db.list_all().await.unwrap();
        let mut corrected = reconciler.reconcile_stale(&db, &records).await.unwrap();
        corrected.sort();

        assert_eq!(corrected, vec!["dead-1", "dead-2"]);
        assert_eq!(db.count_running().await.unwrap(), 1);
        let demoted = db.get_by_job("dead-1").await.unwrap().unwrap();
        assert_eq!(demoted.worker_status(), WorkerStatus::Stopped);
        assert!(
            demoted
                .error_message
                .as_deref()
                .unwrap()
                .starts_with(STALE_MESSAGE)
        );

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
