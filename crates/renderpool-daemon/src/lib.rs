//! Render worker pool supervisor.
//!
//! Runs a bounded pool of rendering-server processes, one per dataset:
//! - Port allocation within a configured range
//! - Process spawning, termination and exit reaping
//! - `SQLite` records of every worker, reconciled against the process table
//! - Admission control and case affinity in the pool manager
//! - A Unix control socket through which the CLI reaches `serve`

pub mod control;
pub mod liveness;
pub mod pool;
pub mod ports;
pub mod storage;
pub mod supervisor;
