//! `SQLite` record store for the render worker pool.
//!
//! One row per job; rows survive supervisor restarts and are only ever
//! transitioned, never deleted, by pool operations.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
