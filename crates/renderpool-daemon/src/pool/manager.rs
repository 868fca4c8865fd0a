//! Render worker pool manager.
//!
//! Every operation that changes whether a port or pid is in use runs inside
//! one critical section guarded by `lock`: the affinity lookup, admission
//! check, port choice, spawn and record insert of `ensure_worker` can never
//! interleave with another caller, a stop, a sweep or the reaper. With a lock
//! file the section also spans every process sharing the database.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use renderpool_core::config::PoolConfig;
use renderpool_core::db::unix_timestamp;

use super::error::PoolError;
use super::lock::PoolLock;
use super::types::{
    EnsureOutcome, EnsureStatus, PortCheck, StopOutcome, StopStatus, WorkerListing, WorkerView,
};
use crate::liveness::LivenessReconciler;
use crate::ports::PortAllocator;
use crate::storage::{Database, WorkerRecord};
use crate::supervisor::{ProcessSupervisor, SupervisorOptions, TerminateOutcome};

const STOPPED_BY_REQUEST: &str = "stopped by request";
const STOPPED_FOR_INACTIVITY: &str = "stopped due to inactivity";
const STALE_SWEEP_MESSAGE: &str = "stale entry cleaned up during inactivity sweep";
const STOPPED_AT_SHUTDOWN: &str = "stopped at supervisor shutdown";

/// Coordinates ports, processes and records for the worker pool.
pub struct PoolManager {
    config: PoolConfig,
    db: Database,
    ports: PortAllocator,
    supervisor: ProcessSupervisor,
    reconciler: LivenessReconciler,
    lock: PoolLock,
}

impl PoolManager {
    pub fn new(config: PoolConfig, db: Database) -> Self {
        let supervisor = ProcessSupervisor::new(SupervisorOptions::from_config(&config));
        let reconciler = LivenessReconciler::from_config(&config);
        Self {
            config,
            db,
            ports: PortAllocator::new(),
            supervisor,
            reconciler,
            lock: PoolLock::new(),
        }
    }

    /// Also hold an exclusive lock on `path` during every pool operation.
    #[must_use]
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock = PoolLock::with_file(path);
        self
    }

    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub const fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn connection_string(&self, port: u16) -> String {
        format!("{}:{port}", self.config.host)
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Return a live worker for `dataset_path`, reusing one if it exists and
    /// starting one otherwise.
    pub async fn ensure_worker(
        &self,
        job_id: &str,
        dataset_path: &str,
    ) -> Result<EnsureOutcome, PoolError> {
        require_non_empty("job_id", job_id)?;
        require_non_empty("dataset_path", dataset_path)?;

        let _guard = self.lock.acquire().await?;

        self.check_job_binding(job_id, dataset_path).await?;

        if let Some((pid, port)) = self
            .running_for_dataset(dataset_path)
            .await?
            .as_ref()
            .and_then(WorkerRecord::endpoint)
        {
            self.db
                .insert_running(job_id, dataset_path, port, pid)
                .await?;
            self.db.touch_worker(port).await?;
            info!(job_id, dataset = dataset_path, port, pid, "Reusing render worker");
            return Ok(EnsureOutcome {
                status: EnsureStatus::Reused,
                port,
                pid,
                connection_string: self.connection_string(port),
            });
        }

        let running = self.reconciled_count().await?;
        if running >= i64::from(self.config.max_concurrent) {
            let err = PoolError::ConcurrencyLimit {
                running,
                max: self.config.max_concurrent,
            };
            warn!(job_id, dataset = dataset_path, running, "Admission refused");
            self.record_failure(job_id, dataset_path, &err).await;
            return Err(err);
        }

        let (start, end) = (self.config.port_range_start, self.config.port_range_end);
        let claimed = self.db.running_ports().await?;
        let Some(port) = self.ports.find_available_excluding(start, end, &claimed) else {
            let err = PoolError::PortExhaustion { start, end };
            warn!(job_id, dataset = dataset_path, start, end, "No free worker port");
            self.record_failure(job_id, dataset_path, &err).await;
            return Err(err);
        };

        let pid = match self.supervisor.spawn(Path::new(dataset_path), port).await {
            Ok(pid) => pid,
            Err(e) => {
                let err = PoolError::from_spawn(e, dataset_path);
                error!(job_id, dataset = dataset_path, port, error = %err, "Worker start failed");
                self.record_failure(job_id, dataset_path, &err).await;
                return Err(err);
            }
        };

        if let Err(e) = self
            .db
            .insert_running(job_id, dataset_path, port, pid)
            .await
        {
            error!(job_id, port, pid, error = %e, "Failed to record worker, terminating it");
            match self.supervisor.terminate(pid).await {
                Ok(outcome) if outcome.is_gone() => {}
                Ok(_) => error!(pid, "Unrecorded worker survived termination"),
                Err(term_err) => error!(pid, error = %term_err, "Failed to terminate unrecorded worker"),
            }
            return Err(e.into());
        }

        info!(job_id, dataset = dataset_path, port, pid, "Render worker started");
        Ok(EnsureOutcome {
            status: EnsureStatus::Started,
            port,
            pid,
            connection_string: self.connection_string(port),
        })
    }

    /// Stop the worker listening on `port`.
    ///
    /// Stopping a port with nothing running, or whose process already died,
    /// succeeds.
    pub async fn stop_worker(&self, port: u16) -> Result<StopOutcome, PoolError> {
        let _guard = self.lock.acquire().await?;
        self.stop_port(port, STOPPED_BY_REQUEST).await
    }

    /// Reconciled inventory of running workers plus pool capacity.
    pub async fn list_workers(&self) -> Result<WorkerListing, PoolError> {
        let _guard = self.lock.acquire().await?;

        let running = self.db.list_running().await?;
        self.reconciler.reconcile_stale(&self.db, &running).await?;

        let workers: Vec<WorkerView> = self
            .db
            .list_running()
            .await?
            .into_iter()
            .map(|record| WorkerView::from_record(record, &self.config.host))
            .collect();

        let (start, end) = (self.config.port_range_start, self.config.port_range_end);
        let claimed = self.db.running_ports().await?;

        Ok(WorkerListing {
            total_count: workers.len(),
            workers,
            port_range: (start, end),
            available_port_count: self.ports.count_available(start, end, &claimed),
            max_concurrent: self.config.max_concurrent,
        })
    }

    /// Record for `job_id`, validated first if it claims to be running.
    pub async fn get_worker_info(&self, job_id: &str) -> Result<Option<WorkerView>, PoolError> {
        let _guard = self.lock.acquire().await?;

        let Some(record) = self.db.get_by_job(job_id).await? else {
            return Ok(None);
        };

        let record = if record.is_running() {
            let corrected = self
                .reconciler
                .reconcile_stale(&self.db, std::slice::from_ref(&record))
                .await?;
            if corrected.is_empty() {
                record
            } else {
                match self.db.get_by_job(job_id).await? {
                    Some(fresh) => fresh,
                    None => return Ok(None),
                }
            }
        } else {
            record
        };

        Ok(Some(WorkerView::from_record(record, &self.config.host)))
    }

    /// Number of live workers after reconciliation.
    pub async fn count_running(&self) -> Result<i64, PoolError> {
        let _guard = self.lock.acquire().await?;
        self.reconciled_count().await
    }

    /// Stop workers bound longer than `threshold_hours` ago. Returns the
    /// job ids whose records were cleaned.
    pub async fn sweep_inactive(&self, threshold_hours: f64) -> Result<Vec<String>, PoolError> {
        if !threshold_hours.is_finite() || threshold_hours <= 0.0 {
            return Err(PoolError::InvalidRequest {
                message: format!("threshold_hours must be positive, got {threshold_hours}"),
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let threshold_secs = (threshold_hours * 3600.0).round() as i64;

        let _guard = self.lock.acquire().await?;

        let inactive = self.db.list_inactive(threshold_secs).await?;
        let cutoff = unix_timestamp() - threshold_secs;
        let mut cleaned = Vec::new();

        let mut workers = BTreeSet::new();
        let mut orphans = Vec::new();
        for record in inactive {
            match record.endpoint() {
                Some((pid, port)) => {
                    workers.insert((port, pid));
                }
                None => orphans.push(record),
            }
        }

        if !orphans.is_empty() {
            cleaned.extend(self.reconciler.reconcile_stale(&self.db, &orphans).await?);
        }

        for (port, pid) in workers {
            let bound: Vec<WorkerRecord> = self
                .db
                .list_running_on_port(port)
                .await?
                .into_iter()
                .filter(|r| r.endpoint() == Some((pid, port)))
                .collect();
            if bound.iter().any(|r| r.started_at >= cutoff) {
                debug!(port, pid, "Worker has a recent binding, not sweeping");
                continue;
            }

            let message = if self.reconciler.validate(pid, Some(port)) {
                match self.supervisor.terminate(pid).await {
                    Ok(outcome) if outcome.is_gone() => STOPPED_FOR_INACTIVITY,
                    Ok(_) => {
                        warn!(port, pid, "Inactive worker survived termination, leaving it running");
                        continue;
                    }
                    Err(e) => {
                        warn!(port, pid, error = %e, "Failed to stop inactive worker");
                        continue;
                    }
                }
            } else {
                STALE_SWEEP_MESSAGE
            };

            self.db.mark_worker_stopped(pid, port, message).await?;
            info!(port, pid, jobs = bound.len(), reason = message, "Swept worker");
            cleaned.extend(bound.into_iter().map(|r| r.job_id));
        }

        Ok(cleaned)
    }

    /// Reconcile every `running` row left by a previous supervisor run.
    pub async fn recover(&self) -> Result<Vec<String>, PoolError> {
        let _guard = self.lock.acquire().await?;

        let running = self.db.list_running().await?;
        let corrected = self.reconciler.reconcile_stale(&self.db, &running).await?;
        info!(
            checked = running.len(),
            corrected = corrected.len(),
            "Recovered worker records"
        );
        Ok(corrected)
    }

    /// Delete `stopped`/`error` history older than `older_than_days`.
    ///
    /// Runs outside the pool lock: only rows no operation will touch again
    /// are deleted.
    pub async fn purge_history(&self, older_than_days: f64) -> Result<u64, PoolError> {
        if !older_than_days.is_finite() || older_than_days < 0.0 {
            return Err(PoolError::InvalidRequest {
                message: format!("older_than_days must be non-negative, got {older_than_days}"),
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let age_secs = (older_than_days * 86_400.0).round() as i64;

        let purged = self.db.purge_records(unix_timestamp() - age_secs).await?;
        info!(purged, older_than_days, "Purged worker history");
        Ok(purged)
    }

    /// Stop every running worker. Failures are logged and skipped.
    pub async fn stop_all(&self) -> Result<Vec<StopOutcome>, PoolError> {
        let _guard = self.lock.acquire().await?;

        let mut outcomes = Vec::new();
        for port in self.db.running_ports().await? {
            match self.stop_port(port, STOPPED_AT_SHUTDOWN).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(port, error = %e, "Failed to stop worker at shutdown"),
            }
        }
        Ok(outcomes)
    }

    /// Mark every tracked worker that has exited as stopped. Returns how many
    /// were reaped.
    pub async fn reap_exited(&self) -> Result<usize, PoolError> {
        let _guard = self.lock.acquire().await?;

        let reaped = self.supervisor.collect_exited().await;
        for worker in &reaped {
            let message = format!("worker exited unexpectedly ({})", worker.status);
            match self
                .db
                .mark_worker_stopped(worker.pid, worker.port, &message)
                .await
            {
                Ok(rows) => warn!(
                    pid = worker.pid,
                    port = worker.port,
                    dataset = %worker.dataset_path.display(),
                    status = %worker.status,
                    rows,
                    "Worker exited"
                ),
                Err(e) => error!(pid = worker.pid, error = %e, "Failed to record worker exit"),
            }
        }
        Ok(reaped.len())
    }

    // =========================================================================
    // Helpers (caller holds the lock)
    // =========================================================================

    /// Refuse to move a job that is still running somewhere else.
    async fn check_job_binding(&self, job_id: &str, dataset_path: &str) -> Result<(), PoolError> {
        let Some(existing) = self.db.get_by_job(job_id).await? else {
            return Ok(());
        };
        if !existing.is_running() || existing.dataset_path == dataset_path {
            return Ok(());
        }

        let alive = existing
            .endpoint()
            .is_some_and(|(pid, port)| self.reconciler.validate(pid, Some(port)));
        if alive {
            return Err(PoolError::JobAlreadyBound {
                job_id: job_id.to_string(),
                dataset_path: existing.dataset_path,
            });
        }

        self.reconciler
            .reconcile_stale(&self.db, std::slice::from_ref(&existing))
            .await?;
        Ok(())
    }

    /// Most recent validated running record for `dataset_path`.
    async fn running_for_dataset(
        &self,
        dataset_path: &str,
    ) -> Result<Option<WorkerRecord>, PoolError> {
        let candidates = self.db.list_running_by_dataset(dataset_path).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        self.reconciler
            .reconcile_stale(&self.db, &candidates)
            .await?;
        Ok(self.db.get_running_by_dataset(dataset_path).await?)
    }

    async fn reconciled_count(&self) -> Result<i64, PoolError> {
        let running = self.db.list_running().await?;
        self.reconciler.reconcile_stale(&self.db, &running).await?;
        Ok(self.db.count_running().await?)
    }

    async fn stop_port(&self, port: u16, reason: &str) -> Result<StopOutcome, PoolError> {
        let records = self.db.list_running_on_port(port).await?;
        if records.is_empty() {
            debug!(port, "No running worker on port");
            return Ok(StopOutcome::new(port, StopStatus::NotRunning));
        }

        let corrected = self.reconciler.reconcile_stale(&self.db, &records).await?;
        let live = self.db.list_running_on_port(port).await?;
        let Some((pid, _)) = live.first().and_then(WorkerRecord::endpoint) else {
            info!(port, corrected = corrected.len(), "Worker was already gone");
            return Ok(StopOutcome::new(port, StopStatus::AlreadyGone));
        };

        let outcome = match self.supervisor.terminate(pid).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(port, pid, error = %e, "Failed to signal worker");
                return Err(PoolError::TerminateFailed {
                    port,
                    pid,
                    still_running: true,
                });
            }
        };

        let status = match outcome {
            TerminateOutcome::Exited => StopStatus::Stopped,
            TerminateOutcome::AlreadyGone => StopStatus::AlreadyGone,
            TerminateOutcome::StillRunning => {
                return Err(PoolError::TerminateFailed {
                    port,
                    pid,
                    still_running: true,
                });
            }
        };

        let rows = self.db.mark_worker_stopped(pid, port, reason).await?;
        info!(port, pid, rows, reason, "Worker stopped");
        Ok(StopOutcome::new(port, status))
    }

    /// Persist an `error` row. A failure here is logged so the caller still
    /// sees the admission or spawn error.
    async fn record_failure(&self, job_id: &str, dataset_path: &str, err: &PoolError) {
        if let Err(db_err) = self
            .db
            .record_error(job_id, dataset_path, &err.detail())
            .await
        {
            error!(job_id, error = %db_err, "Failed to record worker error");
        }
    }
}

/// Bind check for one port, reported with the pool error taxonomy.
pub fn check_port(port: u16) -> PortCheck {
    match PortAllocator::new().check(port).map_err(PoolError::from) {
        Ok(port) => PortCheck {
            port,
            available: true,
            error: None,
            message: None,
        },
        Err(e) => PortCheck {
            port,
            available: false,
            error: Some(e.kind()),
            message: Some(e.detail()),
        },
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), PoolError> {
    if value.trim().is_empty() {
        return Err(PoolError::InvalidRequest {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}
