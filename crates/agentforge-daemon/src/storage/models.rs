//! Database models for the agentforge daemon.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use agentforge_core::model::{
    Feature, FeatureId, FeatureStatus, Priority, RunSettings, Schedule, Weekdays,
};

use super::db::DatabaseError;

/// Feature row without its dependency edges.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub steps: String,
    pub priority: i64,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub failure_count: i64,
    pub last_tested_at: Option<i64>,
    pub created_at: i64,
    pub enqueued_at: i64,
    pub updated_at: i64,
}

impl FeatureRow {
    pub fn into_feature(self, dependencies: BTreeSet<FeatureId>) -> Result<Feature, DatabaseError> {
        let corrupt = |what: String| DatabaseError::Corrupt(format!("feature {}: {what}", self.id));
        let steps: Vec<String> =
            serde_json::from_str(&self.steps).map_err(|e| corrupt(format!("steps: {e}")))?;
        let priority = u8::try_from(self.priority)
            .ok()
            .and_then(|p| Priority::try_from(p).ok())
            .ok_or_else(|| corrupt(format!("priority {}", self.priority)))?;
        let status: FeatureStatus = self.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let failure_count = u32::try_from(self.failure_count).unwrap_or(0);

        Ok(Feature {
            id: self.id,
            name: self.name,
            description: self.description,
            category: self.category,
            steps,
            priority,
            status,
            dependencies,
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at,
            failure_count,
            last_tested_at: self.last_tested_at,
            created_at: self.created_at,
            enqueued_at: self.enqueued_at,
        })
    }
}

/// Dependency edge row.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct DependencyRow {
    pub feature_id: i64,
    pub depends_on: i64,
}

/// Schedule row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleRow {
    pub id: i64,
    pub weekdays: i64,
    pub start_time: String,
    pub duration_minutes: i64,
    pub enabled: i64,
    pub paused: i64,
    pub skip_next: i64,
    pub skip_until: Option<i64>,
    pub overrides: String,
    pub failed_window_start: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = DatabaseError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let corrupt = |what: String| DatabaseError::Corrupt(format!("schedule {}: {what}", row.id));
        let weekdays = u8::try_from(row.weekdays)
            .ok()
            .and_then(|bits| Weekdays::try_from(bits).ok())
            .ok_or_else(|| corrupt(format!("weekdays {}", row.weekdays)))?;
        let duration_minutes = u32::try_from(row.duration_minutes)
            .map_err(|_| corrupt(format!("duration {}", row.duration_minutes)))?;
        let overrides: RunSettings =
            serde_json::from_str(&row.overrides).map_err(|e| corrupt(format!("overrides: {e}")))?;

        Ok(Self {
            id: row.id,
            weekdays,
            start_time: row.start_time,
            duration_minutes,
            enabled: row.enabled != 0,
            paused: row.paused != 0,
            skip_next: row.skip_next != 0,
            skip_until: row.skip_until,
            overrides,
            failed_window_start: row.failed_window_start,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Run history record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: String,
    pub run_trigger: String,
    pub schedule_id: Option<i64>,
    pub settings: String,
    pub status: String,
    pub reason: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

/// Terminal run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Failed,
}

impl RunOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
