//! agentforge Daemon Library
//!
//! Core functionality for the agentforge daemon:
//! - `SQLite` storage for features, schedules and run history
//! - Dependency graph and atomic feature claims
//! - Agent subprocess supervision with policy-gated commands
//! - Run orchestration and time-window scheduling
//! - HTTP control API and event stream

pub mod claims;
pub mod events;
pub mod graph;
pub mod orchestrator;
pub mod project;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod supervisor;
