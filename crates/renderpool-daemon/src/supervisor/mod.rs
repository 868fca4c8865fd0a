//! Worker process supervision: spawning, termination and exit reaping.

pub mod process;
pub mod reaper;

pub use process::{
    ProcessSupervisor, ReapedWorker, SupervisorError, SupervisorOptions, TerminateOutcome,
    process_exists,
};
pub use reaper::spawn_child_reaper;
