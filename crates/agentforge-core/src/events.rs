//! Typed state-change events published by the orchestrator.

use serde::{Deserialize, Serialize};

use crate::model::{
    AgentKind, AgentState, FeatureId, FeatureStatus, RunSettings, RunTrigger,
};
use crate::policy::PolicyTier;

/// One event on the bus, stamped with a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per-daemon sequence; gaps mean a subscriber lagged.
    pub seq: u64,
    pub timestamp: i64,
    pub event: OrchestratorEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted {
        run_id: String,
        trigger: RunTrigger,
        settings: RunSettings,
    },
    RunPaused {
        run_id: String,
    },
    RunResumed {
        run_id: String,
    },
    RunStopped {
        run_id: String,
        reason: String,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        reason: String,
    },
    AgentSpawned {
        agent_id: String,
        mascot: String,
        kind: AgentKind,
        feature_ids: Vec<FeatureId>,
        initializer: bool,
    },
    AgentStateChanged {
        agent_id: String,
        state: AgentState,
        detail: Option<String>,
    },
    AgentExited {
        agent_id: String,
        exit_code: Option<i32>,
    },
    AgentCrashed {
        agent_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
        released: Vec<FeatureId>,
    },
    SpawnQueued {
        kind: AgentKind,
        queued: usize,
    },
    RestartScheduled {
        attempt: u32,
        delay_ms: u64,
        rate_limited: bool,
    },
    FeatureCreated {
        feature_id: FeatureId,
        name: String,
    },
    FeatureRemoved {
        feature_id: FeatureId,
    },
    FeatureClaimed {
        feature_id: FeatureId,
        agent_id: String,
    },
    FeaturePassing {
        feature_id: FeatureId,
        agent_id: Option<String>,
    },
    FeatureFailing {
        feature_id: FeatureId,
        agent_id: Option<String>,
        /// Status after the failure was recorded (`pending` or `failing`).
        status: FeatureStatus,
        failure_count: u32,
    },
    FeatureReleased {
        feature_id: FeatureId,
        status: FeatureStatus,
    },
    CommandDenied {
        agent_id: String,
        command: String,
        tier: Option<PolicyTier>,
        reason: String,
    },
    SandboxViolation {
        agent_id: String,
        path: String,
        reason: String,
    },
    ScheduleTriggered {
        schedule_id: i64,
        run_id: String,
    },
    ScheduleWindowClosed {
        schedule_id: i64,
    },
    ScheduleOccurrenceFailed {
        schedule_id: i64,
        window_start: i64,
    },
    ScheduleWindowMissed {
        schedule_id: i64,
        window_start: i64,
    },
}

impl OrchestratorEvent {
    /// Stable snake-case name of the variant.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunPaused { .. } => "run_paused",
            Self::RunResumed { .. } => "run_resumed",
            Self::RunStopped { .. } => "run_stopped",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::AgentSpawned { .. } => "agent_spawned",
            Self::AgentStateChanged { .. } => "agent_state_changed",
            Self::AgentExited { .. } => "agent_exited",
            Self::AgentCrashed { .. } => "agent_crashed",
            Self::SpawnQueued { .. } => "spawn_queued",
            Self::RestartScheduled { .. } => "restart_scheduled",
            Self::FeatureCreated { .. } => "feature_created",
            Self::FeatureRemoved { .. } => "feature_removed",
            Self::FeatureClaimed { .. } => "feature_claimed",
            Self::FeaturePassing { .. } => "feature_passing",
            Self::FeatureFailing { .. } => "feature_failing",
            Self::FeatureReleased { .. } => "feature_released",
            Self::CommandDenied { .. } => "command_denied",
            Self::SandboxViolation { .. } => "sandbox_violation",
            Self::ScheduleTriggered { .. } => "schedule_triggered",
            Self::ScheduleWindowClosed { .. } => "schedule_window_closed",
            Self::ScheduleOccurrenceFailed { .. } => "schedule_occurrence_failed",
            Self::ScheduleWindowMissed { .. } => "schedule_window_missed",
        }
    }
}
