//! Database queries for the worker record store.
//!
//! Every mutation is a single statement, so concurrent readers never observe
//! a half-written record.

use renderpool_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{WorkerRecord, WorkerStatus};

impl Database {
    // =========================================================================
    // Mutations
    // =========================================================================

    /// Record `job_id` as bound to a running worker, replacing any earlier row
    /// for the same job.
    pub async fn insert_running(
        &self,
        job_id: &str,
        dataset_path: &str,
        port: u16,
        pid: u32,
    ) -> Result<WorkerRecord, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO workers
                (job_id, dataset_path, port, pid, status, started_at, last_activity, error_message)
            VALUES (?, ?, ?, ?, 'running', ?, ?, NULL)
            ON CONFLICT(job_id) DO UPDATE SET
                dataset_path = excluded.dataset_path,
                port = excluded.port,
                pid = excluded.pid,
                status = 'running',
                started_at = excluded.started_at,
                last_activity = excluded.last_activity,
                error_message = NULL
            ",
        )
        .bind(job_id)
        .bind(dataset_path)
        .bind(i64::from(port))
        .bind(i64::from(pid))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.require_job(job_id).await
    }

    /// Record a failed admission or spawn for `job_id`.
    ///
    /// A row that is currently `running` is left untouched.
    pub async fn record_error(
        &self,
        job_id: &str,
        dataset_path: &str,
        message: &str,
    ) -> Result<WorkerRecord, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO workers
                (job_id, dataset_path, port, pid, status, started_at, last_activity, error_message)
            VALUES (?, ?, NULL, NULL, 'error', ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                dataset_path = excluded.dataset_path,
                port = NULL,
                pid = NULL,
                status = 'error',
                started_at = excluded.started_at,
                last_activity = excluded.last_activity,
                error_message = excluded.error_message
            WHERE workers.status != 'running'
            ",
        )
        .bind(job_id)
        .bind(dataset_path)
        .bind(now)
        .bind(now)
        .bind(message)
        .execute(self.pool())
        .await?;

        self.require_job(job_id).await
    }

    /// Change the status of one job's record, stamping `last_activity`.
    ///
    /// Returns `false` if no such job exists.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: WorkerStatus,
        error_message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE workers SET status = ?, error_message = ?, last_activity = ? WHERE job_id = ?",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now)
        .bind(job_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Transition every running row bound to the worker `(pid, port)` to
    /// `stopped`. Returns the number of rows changed.
    pub async fn mark_worker_stopped(
        &self,
        pid: u32,
        port: u16,
        message: &str,
    ) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            r"
            UPDATE workers
            SET status = 'stopped', error_message = ?, last_activity = ?
            WHERE status = 'running' AND pid = ? AND port = ?
            ",
        )
        .bind(message)
        .bind(now)
        .bind(i64::from(pid))
        .bind(i64::from(port))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Stamp `last_activity` on every running row for `port`.
    pub async fn touch_worker(&self, port: u16) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE workers SET last_activity = ? WHERE status = 'running' AND port = ?",
        )
        .bind(unix_timestamp())
        .bind(i64::from(port))
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete `stopped`/`error` rows whose last activity precedes `before`.
    pub async fn purge_records(&self, before: i64) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM workers WHERE status != 'running' AND last_activity < ?")
                .bind(before)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Get the record for a job.
    pub async fn get_by_job(&self, job_id: &str) -> Result<Option<WorkerRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(record)
    }

    async fn require_job(&self, job_id: &str) -> Result<WorkerRecord, DatabaseError> {
        self.get_by_job(job_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Worker record {job_id}")))
    }

    /// Most recently started running record for a dataset.
    pub async fn get_running_by_dataset(
        &self,
        dataset_path: &str,
    ) -> Result<Option<WorkerRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r"
            SELECT * FROM workers
            WHERE status = 'running' AND dataset_path = ?
            ORDER BY started_at DESC, rowid DESC
            LIMIT 1
            ",
        )
        .bind(dataset_path)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    /// All running records for a dataset.
    pub async fn list_running_by_dataset(
        &self,
        dataset_path: &str,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE status = 'running' AND dataset_path = ? ORDER BY started_at ASC",
        )
        .bind(dataset_path)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// All running records bound to a port.
    pub async fn list_running_on_port(
        &self,
        port: u16,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE status = 'running' AND port = ? ORDER BY started_at ASC",
        )
        .bind(i64::from(port))
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// All running records.
    pub async fn list_running(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE status = 'running' ORDER BY port ASC, started_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// Running records started more than `threshold_secs` ago.
    pub async fn list_inactive(
        &self,
        threshold_secs: i64,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let cutoff = unix_timestamp() - threshold_secs;

        let records = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE status = 'running' AND started_at < ? ORDER BY started_at ASC",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// Number of running workers (distinct ports; jobs sharing a worker
    /// count once).
    pub async fn count_running(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(DISTINCT port) FROM workers WHERE status = 'running'",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(count)
    }

    /// Ports currently claimed by running records.
    pub async fn running_ports(&self) -> Result<Vec<u16>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT port FROM workers WHERE status = 'running' AND port IS NOT NULL ORDER BY port",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(port,)| u16::try_from(port).ok())
            .collect())
    }

    /// Full inventory, including stopped and error history.
    pub async fn list_all(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers ORDER BY started_at DESC, rowid DESC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }
}
