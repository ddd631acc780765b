use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Storage-assigned feature identifier.
pub type FeatureId = i64;

/// Lifecycle status of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Passing,
    Failing,
}

impl FeatureStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Passing => "passing",
            Self::Failing => "failing",
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "passing" => Ok(Self::Passing),
            "failing" => Ok(Self::Failing),
            other => Err(Error::Validation(format!("unknown feature status: {other}"))),
        }
    }
}

/// Feature priority, `P1` highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    P1 = 1,
    P2 = 2,
    #[default]
    P3 = 3,
    P4 = 4,
    P5 = 5,
}

impl Priority {
    pub const LOWEST: Self = Self::P5;
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::P1),
            2 => Ok(Self::P2),
            3 => Ok(Self::P3),
            4 => Ok(Self::P4),
            5 => Ok(Self::P5),
            other => Err(Error::Validation(format!(
                "priority must be between 1 and 5, got {other}"
            ))),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as Self
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", u8::from(*self))
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches(['P', 'p']);
        let n: u8 = digits
            .parse()
            .map_err(|_| Error::Validation(format!("invalid priority: {s}")))?;
        Self::try_from(n)
    }
}

/// A discrete unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub description: String,
    pub category: String,
    /// Ordered verification steps.
    pub steps: Vec<String>,
    pub priority: Priority,
    pub status: FeatureStatus,
    pub dependencies: BTreeSet<FeatureId>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub failure_count: u32,
    pub last_tested_at: Option<i64>,
    pub created_at: i64,
    /// FIFO key within a priority tier; reset when the feature is skipped.
    pub enqueued_at: i64,
}

impl Feature {
    pub const fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }
}

/// Input for creating a feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeature {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub dependencies: Vec<FeatureId>,
}

impl NewFeature {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = FeatureId>) -> Self {
        self.dependencies.extend(deps);
        self
    }
}

/// Bulk-creation entry; may depend on earlier entries of the same batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFeatureSpec {
    #[serde(flatten)]
    pub feature: NewFeature,
    /// Zero-based indices into the batch; must point at earlier entries.
    #[serde(default)]
    pub depends_on_indices: Vec<usize>,
}

/// Outcome reported when a claim is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Passing,
    Failing,
    /// Return to the queue with no verdict.
    Pending,
}

/// A pending feature that cannot run yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedFeature {
    pub feature: Feature,
    /// Dependencies that are not `passing` yet.
    pub blocked_by: Vec<FeatureId>,
}

/// Progress counters over the whole feature set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub passing: usize,
    pub failing: usize,
    pub percentage: f64,
}

impl FeatureStats {
    pub fn from_statuses(statuses: impl IntoIterator<Item = FeatureStatus>) -> Self {
        let mut stats = Self::default();
        for status in statuses {
            stats.total += 1;
            match status {
                FeatureStatus::Pending => stats.pending += 1,
                FeatureStatus::InProgress => stats.in_progress += 1,
                FeatureStatus::Passing => stats.passing += 1,
                FeatureStatus::Failing => stats.failing += 1,
            }
        }
        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let pct = stats.passing as f64 / stats.total as f64 * 100.0;
            stats.percentage = (pct * 10.0).round() / 10.0;
        }
        stats
    }
}

/// Display status of a node in the dependency graph view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNodeStatus {
    Done,
    Blocked,
    InProgress,
    Failing,
    Pending,
}

impl GraphNodeStatus {
    /// Derive the display status; unmet dependencies win over queue state.
    pub const fn derive(status: FeatureStatus, blocked: bool) -> Self {
        match status {
            FeatureStatus::Passing => Self::Done,
            _ if blocked => Self::Blocked,
            FeatureStatus::InProgress => Self::InProgress,
            FeatureStatus::Failing => Self::Failing,
            FeatureStatus::Pending => Self::Pending,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
            Self::Failing => "failing",
            Self::Pending => "pending",
        }
    }
}

impl fmt::Display for GraphNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: FeatureId,
    pub name: String,
    pub category: String,
    pub status: GraphNodeStatus,
    pub priority: Priority,
    pub dependencies: BTreeSet<FeatureId>,
}

/// `source` must pass before `target` can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: FeatureId,
    pub target: FeatureId,
}

/// Nodes and edges of the whole feature graph, for rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_p1_first() {
        assert!(Priority::P1 < Priority::P5);
        assert_eq!("p2".parse::<Priority>().unwrap(), Priority::P2);
        assert_eq!("4".parse::<Priority>().unwrap(), Priority::P4);
        assert!("P9".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_serializes_as_number() {
        assert_eq!(serde_json::to_string(&Priority::P1).unwrap(), "1");
        assert!(serde_json::from_str::<Priority>("0").is_err());
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            FeatureStatus::Pending,
            FeatureStatus::InProgress,
            FeatureStatus::Passing,
            FeatureStatus::Failing,
        ] {
            assert_eq!(status.as_str().parse::<FeatureStatus>().unwrap(), status);
        }
    }

    #[test]
    fn stats_percentage_rounds() {
        let stats = FeatureStats::from_statuses([
            FeatureStatus::Passing,
            FeatureStatus::Pending,
            FeatureStatus::InProgress,
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passing, 1);
        assert!((stats.percentage - 33.3).abs() < f64::EPSILON);
        assert!(FeatureStats::from_statuses([]).percentage.abs() < f64::EPSILON);
    }

    #[test]
    fn bulk_spec_flattens_feature_fields() {
        let spec: NewFeatureSpec = serde_json::from_str(
            r#"{"name": "login", "priority": 1, "depends_on_indices": [0]}"#,
        )
        .unwrap();
        assert_eq!(spec.feature.name, "login");
        assert_eq!(spec.feature.priority, Priority::P1);
        assert_eq!(spec.depends_on_indices, vec![0]);
    }
}
