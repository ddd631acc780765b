//! Domain types shared by the daemon, its HTTP API and the CLI.

mod agent;
mod feature;
mod run;
mod schedule;

pub use agent::{AgentInfo, AgentKind, AgentState};
pub use feature::{
    BlockedFeature, Feature, FeatureId, FeatureStats, FeatureStatus, GraphEdge, GraphNode,
    GraphNodeStatus, GraphView, NewFeature, NewFeatureSpec, Priority, ReleaseOutcome,
};
pub use run::{ControlResponse, RunSettings, RunState, RunStatus, RunTrigger};
pub use schedule::{NewSchedule, Schedule, ScheduleUpdate, Weekdays, parse_start_time};
