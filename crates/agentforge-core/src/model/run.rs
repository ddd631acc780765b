use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-run overrides; unset fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Coding-agent concurrency for this run.
    pub max_concurrency: Option<u8>,
    pub model: Option<String>,
    /// Fast mode: no regression testing agents.
    pub yolo: bool,
}

/// Who started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled {
        schedule_id: i64,
        window_start: i64,
        window_end: i64,
    },
}

impl RunTrigger {
    pub const fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }

    pub const fn schedule_id(&self) -> Option<i64> {
        match self {
            Self::Manual => None,
            Self::Scheduled { schedule_id, .. } => Some(*schedule_id),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled { .. } => "scheduled",
        }
    }
}

/// Orchestrator run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
}

impl RunState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        }
    }

    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current orchestrator status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub run_id: Option<String>,
    pub trigger: Option<RunTrigger>,
    pub settings: Option<RunSettings>,
    pub started_at: Option<i64>,
    pub agents_running: usize,
    pub spawns_queued: usize,
}

impl RunStatus {
    pub const fn idle() -> Self {
        Self {
            state: RunState::Idle,
            run_id: None,
            trigger: None,
            settings: None,
            started_at: None,
            agents_running: 0,
            spawns_queued: 0,
        }
    }
}

/// Result of a control-surface operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub state: RunState,
    pub message: String,
}
