#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end tests for the render worker pool.
//!
//! Workers are `sh -c <script> pvserver --server-port=<port>` processes, so
//! every test drives real child processes through spawn, validation,
//! termination and reaping. Each test owns a disjoint port range.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tempfile::TempDir;

use renderpool_core::config::PoolConfig;
use renderpool_daemon::pool::{EnsureStatus, PoolError, PoolManager, StopStatus};
use renderpool_daemon::ports::PortAllocator;
use renderpool_daemon::storage::{Database, WorkerStatus};
use renderpool_daemon::supervisor::{process_exists, spawn_child_reaper};

const LOOP: &str = "while :; do sleep 1; done";

#[allow(clippy::cast_sign_loss)]
const DEAD_PID: u32 = i32::MAX as u32;

fn sh_config(start: u16, end: u16, max_concurrent: u32, script: &str) -> PoolConfig {
    PoolConfig {
        port_range_start: start,
        port_range_end: end,
        max_concurrent,
        worker_binary: "sh".into(),
        worker_args: vec!["-c".to_string(), script.to_string(), "pvserver".to_string()],
        liveness_check_delay_ms: 200,
        graceful_timeout_secs: 2,
        forceful_timeout_secs: 2,
        ..PoolConfig::default()
    }
}

async fn pool(config: PoolConfig) -> PoolManager {
    PoolManager::new(config, Database::open_in_memory().await.unwrap())
}

/// Dataset directories `names` under one temp root.
fn datasets(names: &[&str]) -> (TempDir, Vec<String>) {
    let root = TempDir::new().unwrap();
    let paths = names
        .iter()
        .map(|name| {
            let dir = root.path().join(name);
            std::fs::create_dir(&dir).unwrap();
            dir.to_str().unwrap().to_string()
        })
        .collect();
    (root, paths)
}

fn kill_group(pid: u32) {
    killpg(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();
}

async fn wait_until_gone(pid: u32) {
    for _ in 0..50 {
        if !process_exists(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("process {pid} still exists");
}

#[tokio::test]
async fn test_end_to_end_scenario() {
    let pool = pool(sh_config(11111, 11113, 2, LOOP)).await;
    let (_root, dirs) = datasets(&["a", "b", "c"]);
    let (a, b, c) = (&dirs[0], &dirs[1], &dirs[2]);

    let job1 = pool.ensure_worker("job1", a).await.unwrap();
    assert_eq!(job1.status, EnsureStatus::Started);
    assert_eq!(job1.port, 11111);
    assert_eq!(job1.connection_string, "localhost:11111");

    let job2 = pool.ensure_worker("job2", a).await.unwrap();
    assert_eq!(job2.status, EnsureStatus::Reused);
    assert_eq!((job2.port, job2.pid), (11111, job1.pid));

    let job3 = pool.ensure_worker("job3", b).await.unwrap();
    assert_eq!(job3.status, EnsureStatus::Started);
    assert_eq!(job3.port, 11112);

    let err = pool.ensure_worker("job4", c).await.unwrap_err();
    assert!(
        matches!(err, PoolError::ConcurrencyLimit { running: 2, max: 2 }),
        "{err:?}"
    );
    let rejected = pool.db().get_by_job("job4").await.unwrap().unwrap();
    assert_eq!(rejected.worker_status(), WorkerStatus::Error);
    assert_eq!(pool.count_running().await.unwrap(), 2);

    let stopped = pool.stop_worker(11112).await.unwrap();
    assert_eq!(stopped.status, StopStatus::Stopped);
    assert_eq!(
        PortAllocator::new().find_available(11112, 11112),
        Some(11112)
    );

    let job4 = pool.ensure_worker("job4", c).await.unwrap();
    assert_eq!(job4.status, EnsureStatus::Started);
    assert_eq!(job4.port, 11112);

    let listing = pool.list_workers().await.unwrap();
    assert_eq!(listing.total_count, 3);
    assert_eq!(listing.port_range, (11111, 11113));

    pool.stop_all().await.unwrap();
    assert_eq!(pool.count_running().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_respect_ceiling() {
    let pool = Arc::new(pool(sh_config(43_001, 43_008, 2, LOOP)).await);
    let (_root, dirs) = datasets(&["d1", "d2", "d3", "d4", "d5"]);

    let handles: Vec<_> = dirs
        .iter()
        .enumerate()
        .map(|(i, dir)| {
            let pool = Arc::clone(&pool);
            let dir = dir.clone();
            tokio::spawn(async move { pool.ensure_worker(&format!("job{i}"), &dir).await })
        })
        .collect();

    let mut started = Vec::new();
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => started.push(outcome),
            Err(PoolError::ConcurrencyLimit { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(started.len(), 2);
    assert_eq!(refused, 3);
    assert_eq!(pool.count_running().await.unwrap(), 2);

    let ports: HashSet<u16> = started.iter().map(|o| o.port).collect();
    assert_eq!(ports.len(), 2, "running workers must not share a port");

    pool.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_callers_share_one_worker_per_dataset() {
    let pool = Arc::new(pool(sh_config(43_011, 43_014, 3, LOOP)).await);
    let (_root, dirs) = datasets(&["shared"]);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let dir = dirs[0].clone();
            tokio::spawn(async move { pool.ensure_worker(&format!("job{i}"), &dir).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    let started = outcomes
        .iter()
        .filter(|o| o.status == EnsureStatus::Started)
        .count();
    assert_eq!(started, 1);
    let endpoints: HashSet<(u32, u16)> = outcomes.iter().map(|o| (o.pid, o.port)).collect();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(pool.count_running().await.unwrap(), 1);

    pool.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_managers_sharing_a_database_respect_ceiling() {
    let state = TempDir::new().unwrap();
    let db_path = state.path().join("workers.db");
    let lock_path = state.path().join("workers.db.lock");
    let config = sh_config(43_101, 43_102, 1, LOOP);

    let first = PoolManager::new(config.clone(), Database::open(&db_path).await.unwrap())
        .with_lock_file(&lock_path);
    let second = PoolManager::new(config, Database::open(&db_path).await.unwrap())
        .with_lock_file(&lock_path);
    let (_root, dirs) = datasets(&["left", "right"]);

    let (a, b) = tokio::join!(
        first.ensure_worker("job-left", &dirs[0]),
        second.ensure_worker("job-right", &dirs[1]),
    );

    let results = [a, b];
    let started = results
        .iter()
        .filter(|r| matches!(r, Ok(o) if o.status == EnsureStatus::Started))
        .count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(PoolError::ConcurrencyLimit { max: 1, .. })))
        .count();
    assert_eq!((started, refused), (1, 1), "{results:?}");
    assert_eq!(first.count_running().await.unwrap(), 1);
    assert_eq!(second.count_running().await.unwrap(), 1);

    let owner = if results[0].is_ok() { &first } else { &second };
    owner.stop_all().await.unwrap();
    assert_eq!(first.count_running().await.unwrap(), 0);
}

#[tokio::test]
async fn test_affinity_lookup_skips_dead_worker() {
    let pool = pool(sh_config(43_021, 43_023, 2, LOOP)).await;
    let (_root, dirs) = datasets(&["case"]);

    pool.db()
        .insert_running("old", &dirs[0], 43_021, DEAD_PID)
        .await
        .unwrap();

    let outcome = pool.ensure_worker("new", &dirs[0]).await.unwrap();

    assert_eq!(outcome.status, EnsureStatus::Started);
    assert_ne!(outcome.pid, DEAD_PID);
    let old = pool.db().get_by_job("old").await.unwrap().unwrap();
    assert_eq!(old.worker_status(), WorkerStatus::Stopped);
    assert!(old.error_message.is_some_and(|m| !m.is_empty()));

    pool.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let pool = pool(sh_config(43_031, 43_033, 2, LOOP)).await;
    let (_root, dirs) = datasets(&["case"]);

    let started = pool.ensure_worker("job1", &dirs[0]).await.unwrap();

    let first = pool.stop_worker(started.port).await.unwrap();
    assert_eq!(first.status, StopStatus::Stopped);
    wait_until_gone(started.pid).await;

    let second = pool.stop_worker(started.port).await.unwrap();
    assert_eq!(second.status, StopStatus::NotRunning);

    let record = pool.db().get_by_job("job1").await.unwrap().unwrap();
    assert_eq!(record.worker_status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn test_stop_after_external_kill_reports_already_gone() {
    let pool = pool(sh_config(43_041, 43_043, 2, LOOP)).await;
    let (_root, dirs) = datasets(&["case"]);

    let started = pool.ensure_worker("job1", &dirs[0]).await.unwrap();
    kill_group(started.pid);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcome = pool.stop_worker(started.port).await.unwrap();

    assert_eq!(outcome.status, StopStatus::AlreadyGone);
    assert_eq!(pool.count_running().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reaper_marks_exited_worker_stopped() {
    let pool = Arc::new(pool(sh_config(43_051, 43_053, 2, "sleep 1")).await);
    let (_root, dirs) = datasets(&["case"]);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper = spawn_child_reaper(Arc::clone(&pool), shutdown_rx).unwrap();

    let started = pool.ensure_worker("job1", &dirs[0]).await.unwrap();
    assert_eq!(started.status, EnsureStatus::Started);

    let mut record = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = pool.db().get_by_job("job1").await.unwrap().unwrap();
        if !current.is_running() {
            record = Some(current);
            break;
        }
    }

    let record = record.unwrap();
    assert_eq!(record.worker_status(), WorkerStatus::Stopped);
    assert!(
        record
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("worker exited unexpectedly")
    );
    assert!(!pool.supervisor().is_tracked(started.pid).await);

    shutdown_tx.send(true).unwrap();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_startup_recovery_demotes_dead_rows() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("workers.db");

    let db = Database::open(&db_path).await.unwrap();
    db.insert_running("a", "/data/a", 43_061, DEAD_PID)
        .await
        .unwrap();
    db.insert_running("b", "/data/a", 43_061, DEAD_PID)
        .await
        .unwrap();
    db.pool().close().await;

    let db = Database::open(&db_path).await.unwrap();
    let pool = PoolManager::new(sh_config(43_061, 43_062, 1, LOOP), db);

    let mut corrected = pool.recover().await.unwrap();
    corrected.sort();

    assert_eq!(corrected, vec!["a", "b"]);
    assert_eq!(pool.list_workers().await.unwrap().total_count, 0);
    assert_eq!(pool.db().list_all().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_failure_records_diagnostic() {
    let pool = pool(sh_config(
        43_071,
        43_072,
        1,
        "echo 'cannot open case file' >&2; exit 2",
    ))
    .await;
    let (_root, dirs) = datasets(&["broken"]);

    let err = pool.ensure_worker("job1", &dirs[0]).await.unwrap_err();

    let PoolError::ProcessStart { diagnostic, .. } = &err else {
        panic!("expected ProcessStart, got {err:?}");
    };
    assert!(diagnostic.contains("cannot open case file"));

    let record = pool.db().get_by_job("job1").await.unwrap().unwrap();
    assert_eq!(record.worker_status(), WorkerStatus::Error);
    assert!(
        record
            .error_message
            .as_deref()
            .unwrap()
            .contains("cannot open case file")
    );
    assert_eq!(pool.count_running().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_binary_and_dataset() {
    let mut config = sh_config(43_081, 43_082, 1, LOOP);
    config.worker_binary = "/nonexistent/renderpool-test-worker".into();
    let pool = pool(config).await;
    let (_root, dirs) = datasets(&["case"]);

    let err = pool.ensure_worker("job1", &dirs[0]).await.unwrap_err();
    assert!(matches!(err, PoolError::BinaryNotFound { .. }), "{err:?}");
    let record = pool.db().get_by_job("job1").await.unwrap().unwrap();
    assert_eq!(record.worker_status(), WorkerStatus::Error);

    let missing = Path::new(&dirs[0]).join("does-not-exist");
    let err = pool
        .ensure_worker("job2", missing.to_str().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ProcessStart { .. }), "{err:?}");
}

#[tokio::test]
async fn test_port_exhaustion_is_recorded() {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let busy = listener.local_addr().unwrap().port();
    let pool = pool(sh_config(busy, busy, 2, LOOP)).await;
    let (_root, dirs) = datasets(&["case"]);

    let err = pool.ensure_worker("job1", &dirs[0]).await.unwrap_err();

    assert!(
        matches!(err, PoolError::PortExhaustion { start, end } if start == busy && end == busy),
        "{err:?}"
    );
    let record = pool.db().get_by_job("job1").await.unwrap().unwrap();
    assert_eq!(record.worker_status(), WorkerStatus::Error);
    drop(listener);
}

#[tokio::test]
async fn test_sweep_stops_only_old_workers() {
    let pool = pool(sh_config(43_091, 43_094, 3, LOOP)).await;
    let (_root, dirs) = datasets(&["old", "fresh"]);

    let old = pool.ensure_worker("old", &dirs[0]).await.unwrap();
    let fresh = pool.ensure_worker("fresh", &dirs[1]).await.unwrap();
    pool.db()
        .insert_running("ghost", "/data/ghost", 43_094, DEAD_PID)
        .await
        .unwrap();
    sqlx::query("UPDATE workers SET started_at = started_at - 7200 WHERE job_id IN ('old', 'ghost')")
        .execute(pool.db().pool())
        .await
        .unwrap();

    let mut cleaned = pool.sweep_inactive(1.0).await.unwrap();
    cleaned.sort();

    assert_eq!(cleaned, vec!["ghost", "old"]);
    wait_until_gone(old.pid).await;

    let old_record = pool.db().get_by_job("old").await.unwrap().unwrap();
    assert_eq!(
        old_record.error_message.as_deref(),
        Some("stopped due to inactivity")
    );
    let ghost = pool.db().get_by_job("ghost").await.unwrap().unwrap();
    assert_eq!(
        ghost.error_message.as_deref(),
        Some("stale entry cleaned up during inactivity sweep")
    );

    let still = pool.get_worker_info("fresh").await.unwrap().unwrap();
    assert_eq!(still.status, WorkerStatus::Running);
    assert_eq!(still.pid, Some(fresh.pid));

    pool.stop_all().await.unwrap();
}
