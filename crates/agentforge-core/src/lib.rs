//! agentforge Core Library
//!
//! Shared functionality for agentforge components:
//! - Domain model (features, agents, runs, schedules) and event types
//! - Configuration resolution and hierarchy
//! - Layered command policy engine and agent sandbox
//! - Common error types, database and tracing helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod policy;
pub mod sandbox;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use events::{EventEnvelope, OrchestratorEvent};
pub use policy::{Decision, PolicyEngine, PolicyTier};
pub use sandbox::{SandboxConfig, SandboxPolicy, SandboxViolation};
