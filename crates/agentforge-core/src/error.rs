//! Error types for the agentforge core library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for agentforge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy document error
    #[error("Policy error: {0}")]
    Policy(String),

    /// Model validation error (bad schedule time, unknown status, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Orchestration error taxonomy shared by every component.
///
/// Component error enums map themselves onto one of these kinds so that
/// observers (event stream, HTTP clients) can react without knowing the
/// concrete Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Command blocked by the policy engine.
    PolicyDenied,
    /// Graph mutation rejected; nothing was changed.
    CycleDetected,
    /// Lost a claim race.
    ClaimConflict,
    /// Agent subprocess died unexpectedly.
    AgentCrashed,
    /// Spawn rejected by a concurrency ceiling; the request was queued.
    ConcurrencyExceeded,
    /// Access outside the sandbox root or into a denylisted directory.
    SandboxViolation,
    /// A schedule window elapsed without a run.
    ScheduleWindowMissed,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PolicyDenied => "policy_denied",
            Self::CycleDetected => "cycle_detected",
            Self::ClaimConflict => "claim_conflict",
            Self::AgentCrashed => "agent_crashed",
            Self::ConcurrencyExceeded => "concurrency_exceeded",
            Self::SandboxViolation => "sandbox_violation",
            Self::ScheduleWindowMissed => "schedule_window_missed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ConcurrencyExceeded).unwrap();
        assert_eq!(json, "\"concurrency_exceeded\"");
        assert_eq!(ErrorKind::CycleDetected.to_string(), "cycle_detected");
    }
}
