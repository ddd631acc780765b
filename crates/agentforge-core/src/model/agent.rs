use std::fmt;

use serde::{Deserialize, Serialize};

use super::feature::FeatureId;

/// What an agent process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Implements pending features.
    Coding,
    /// Re-verifies passing features.
    Testing,
}

impl AgentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coding => "coding",
            Self::Testing => "testing",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display state reported by a running agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Thinking,
    Working,
    Testing,
    Success,
    Error,
    Struggling,
}

impl AgentState {
    pub const ALL: [Self; 6] = [
        Self::Thinking,
        Self::Working,
        Self::Testing,
        Self::Success,
        Self::Error,
        Self::Struggling,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::Working => "working",
            Self::Testing => "testing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Struggling => "struggling",
        }
    }

    /// Human-readable status line for dashboards.
    pub const fn description(self) -> &'static str {
        match self {
            Self::Thinking => "Planning the next step",
            Self::Working => "Editing code",
            Self::Testing => "Running verification steps",
            Self::Success => "Finished its features",
            Self::Error => "Exited with an error",
            Self::Struggling => "Repeated failures on the current feature",
        }
    }

    /// No further state updates are expected.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Needs operator attention.
    pub const fn needs_attention(self) -> bool {
        matches!(self, Self::Error | Self::Struggling)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of a supervised agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub mascot: String,
    pub kind: AgentKind,
    pub state: AgentState,
    pub pid: Option<u32>,
    pub feature_ids: Vec<FeatureId>,
    pub restart_count: u32,
    pub initializer: bool,
    pub started_at: i64,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn only_success_and_error_are_terminal() {
        let terminal: Vec<_> = AgentState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![AgentState::Success, AgentState::Error]);
    }

    #[test]
    fn state_parses_from_protocol_string() {
        let state: AgentState = serde_json::from_str("\"struggling\"").unwrap();
        assert_eq!(state, AgentState::Struggling);
        assert!(state.needs_attention());
        assert!(serde_json::from_str::<AgentState>("\"sleeping\"").is_err());
    }
}
