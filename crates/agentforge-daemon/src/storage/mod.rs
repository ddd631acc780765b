//! `SQLite` storage for the agentforge daemon.
//!
//! Provides persistence for features, dependency edges, schedules and runs.

mod db;
mod feature_queries;
mod models;
mod run_queries;
mod schedule_queries;

pub use db::{Database, DatabaseError};
pub use models::*;
