//! Pool critical section.
//!
//! A tokio mutex orders callers inside one process. When a lock file is
//! configured, an exclusive `flock` on it is taken as well, so several
//! `renderpool` processes sharing one database still admit workers one at a
//! time.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Errors taking the cross-process pool lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to lock {path}: {errno}")]
    Flock { path: String, errno: Errno },

    #[error("Lock task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Mutual exclusion for pool mutations.
pub struct PoolLock {
    local: Mutex<()>,
    file: Option<PathBuf>,
}

/// Held for the duration of one pool operation. Dropping it releases the
/// file lock and then the in-process mutex.
pub struct PoolGuard<'a> {
    _file: Option<Flock<File>>,
    _local: MutexGuard<'a, ()>,
}

impl PoolLock {
    /// In-process exclusion only.
    pub fn new() -> Self {
        Self {
            local: Mutex::new(()),
            file: None,
        }
    }

    /// In-process exclusion plus an exclusive `flock` on `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            local: Mutex::new(()),
            file: Some(path.into()),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub async fn acquire(&self) -> Result<PoolGuard<'_>, LockError> {
        let local = self.local.lock().await;

        let file = match &self.file {
            Some(path) => {
                let path = path.clone();
                Some(tokio::task::spawn_blocking(move || lock_file(&path)).await??)
            }
            None => None,
        };

        Ok(PoolGuard {
            _file: file,
            _local: local,
        })
    }
}

impl Default for PoolLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks until the exclusive lock on `path` is granted.
fn lock_file(path: &Path) -> Result<Flock<File>, LockError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: path.display().to_string(),
                source,
            })?;
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.display().to_string(),
            source,
        })?;

    debug!(path = %path.display(), "Waiting for pool lock");
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| LockError::Flock {
        path: path.display().to_string(),
        errno,
    })
}
