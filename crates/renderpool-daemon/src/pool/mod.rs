//! Pool manager: admission control, case affinity and the worker lifecycle.

mod error;
mod lock;
mod manager;
mod sweeper;
mod types;

pub use error::PoolError;
pub use lock::{LockError, PoolGuard, PoolLock};
pub use manager::{PoolManager, check_port};
pub use sweeper::spawn_inactivity_sweeper;
pub use types::{
    EnsureOutcome, EnsureStatus, PortCheck, StopOutcome, StopStatus, WorkerListing, WorkerView,
};
