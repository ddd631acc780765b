//! Feature backlog commands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;

use agentforge_core::model::{Feature, FeatureId, GraphView, NewFeature, NewFeatureSpec, Priority};

use crate::client::DaemonClient;
use crate::fmt::{id_list, timestamp, truncate};

/// Feature subcommand actions.
#[derive(Subcommand, Debug)]
pub enum FeatureAction {
    /// List all features
    List,
    /// List features that can be claimed now
    Ready,
    /// List pending features waiting on dependencies
    Blocked,
    /// Show progress counters
    Stats,
    /// Show the dependency graph with derived node status
    Graph,
    /// Show feature details
    Show {
        /// Feature ID
        id: FeatureId,
    },
    /// Add a feature
    Add {
        /// Feature name
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "")]
        category: String,
        /// Priority 1 (highest) to 5, or P1..P5
        #[arg(short, long, default_value = "3")]
        priority: Priority,
        /// Verification step (repeatable)
        #[arg(short, long = "step")]
        steps: Vec<String>,
        /// Dependency feature ID (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<FeatureId>,
    },
    /// Add features from a JSON array file
    Import {
        /// File with `[{"name": ..., "depends_on_indices": [...]}, ...]`
        file: PathBuf,
    },
    /// Remove a feature
    Remove {
        id: FeatureId,
    },
    /// Move a feature to the back of the queue
    Skip {
        id: FeatureId,
    },
    /// Return a failing feature to the queue
    Retry {
        id: FeatureId,
    },
    /// Replace a feature's dependencies
    Deps {
        id: FeatureId,
        /// New dependency IDs; none clears them
        dependencies: Vec<FeatureId>,
    },
}

/// Execute a feature subcommand.
pub async fn run(client: &DaemonClient, action: FeatureAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        FeatureAction::List => {
            let features = client.features().await?;
            write_table(&mut out, &features)?;
        }
        FeatureAction::Ready => {
            let features = client.ready().await?;
            write_table(&mut out, &features)?;
        }
        FeatureAction::Blocked => {
            let blocked = client.blocked().await?;
            if blocked.is_empty() {
                writeln!(out, "No blocked features.")?;
            } else {
                writeln!(out, "{:<6}  {:<40}  BLOCKED BY", "ID", "NAME")?;
                for entry in &blocked {
                    writeln!(
                        out,
                        "{:<6}  {:<40}  {}",
                        entry.feature.id,
                        truncate(&entry.feature.name, 40),
                        id_list(&entry.blocked_by),
                    )?;
                }
            }
        }
        FeatureAction::Stats => {
            let s = client.stats().await?;
            writeln!(out, "Total:       {}", s.total)?;
            writeln!(out, "Passing:     {}", s.passing)?;
            writeln!(out, "In progress: {}", s.in_progress)?;
            writeln!(out, "Pending:     {}", s.pending)?;
            writeln!(out, "Failing:     {}", s.failing)?;
            writeln!(out, "Complete:    {:.1}%", s.percentage)?;
        }
        FeatureAction::Graph => {
            let view = client.graph().await?;
            write_graph(&mut out, &view)?;
        }
        FeatureAction::Show { id } => {
            let feature = client.feature(id).await?;
            write_detail(&mut out, &feature)?;
        }
        FeatureAction::Add {
            name,
            description,
            category,
            priority,
            steps,
            depends_on,
        } => {
            let new = NewFeature {
                name,
                description,
                category,
                steps,
                priority,
                dependencies: depends_on,
            };
            let feature = client.add_feature(&new).await?;
            writeln!(out, "Created feature #{}: {}", feature.id, feature.name)?;
        }
        FeatureAction::Import { file } => {
            let specs = read_specs(&file)?;
            let created = client.add_features(&specs).await?;
            writeln!(
                out,
                "Imported {} feature(s): {}",
                created.len(),
                id_list(created.iter().map(|f| f.id))
            )?;
        }
        FeatureAction::Remove { id } => {
            let feature = client.remove_feature(id).await?;
            writeln!(out, "Removed feature #{}: {}", feature.id, feature.name)?;
        }
        FeatureAction::Skip { id } => {
            let feature = client.skip_feature(id).await?;
            writeln!(
                out,
                "Feature #{} moved to the back of the queue ({}).",
                feature.id, feature.priority
            )?;
        }
        FeatureAction::Retry { id } => {
            let feature = client.retry_feature(id).await?;
            writeln!(out, "Feature #{} is {} again.", feature.id, feature.status)?;
        }
        FeatureAction::Deps { id, dependencies } => {
            let feature = client.set_dependencies(id, &dependencies).await?;
            writeln!(
                out,
                "Feature #{} depends on [{}].",
                feature.id,
                id_list(&feature.dependencies)
            )?;
        }
    }
    Ok(())
}

fn read_specs(file: &PathBuf) -> anyhow::Result<Vec<NewFeatureSpec>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of features", file.display()))
}

fn write_table(w: &mut impl Write, features: &[Feature]) -> io::Result<()> {
    if features.is_empty() {
        return writeln!(w, "No features found.");
    }
    writeln!(
        w,
        "{:<6}  {:<3}  {:<11}  {:<40}  {:<12}  DEPS",
        "ID", "PRI", "STATUS", "NAME", "CLAIMED BY"
    )?;
    for f in features {
        writeln!(
            w,
            "{:<6}  {:<3}  {:<11}  {:<40}  {:<12}  {}",
            f.id,
            f.priority,
            f.status,
            truncate(&f.name, 40),
            truncate(f.claimed_by.as_deref().unwrap_or("-"), 12),
            id_list(&f.dependencies),
        )?;
    }
    writeln!(w, "\n{} feature(s)", features.len())
}

fn write_graph(w: &mut impl Write, view: &GraphView) -> io::Result<()> {
    if view.nodes.is_empty() {
        return writeln!(w, "No features found.");
    }
    writeln!(w, "{:<6}  {:<11}  {:<40}  AFTER", "ID", "STATUS", "NAME")?;
    for node in &view.nodes {
        writeln!(
            w,
            "{:<6}  {:<11}  {:<40}  {}",
            node.id,
            node.status,
            truncate(&node.name, 40),
            id_list(&node.dependencies),
        )?;
    }
    writeln!(w, "\n{} node(s), {} edge(s)", view.nodes.len(), view.edges.len())
}

fn write_detail(w: &mut impl Write, f: &Feature) -> io::Result<()> {
    writeln!(w, "  ID:           {}", f.id)?;
    writeln!(w, "  Name:         {}", f.name)?;
    if !f.description.is_empty() {
        writeln!(w, "  Description:  {}", f.description)?;
    }
    if !f.category.is_empty() {
        writeln!(w, "  Category:     {}", f.category)?;
    }
    writeln!(w, "  Priority:     {}", f.priority)?;
    writeln!(w, "  Status:       {}", f.status)?;
    writeln!(w, "  Dependencies: {}", id_list(&f.dependencies))?;
    if let Some(ref agent) = f.claimed_by {
        writeln!(w, "  Claimed by:   {agent}")?;
    }
    if f.failure_count > 0 {
        writeln!(w, "  Failures:     {}", f.failure_count)?;
    }
    if let Some(ts) = f.last_tested_at {
        writeln!(w, "  Last tested:  {}", timestamp(ts))?;
    }
    writeln!(w, "  Created:      {}", timestamp(f.created_at))?;
    if !f.steps.is_empty() {
        writeln!(w, "  Steps:")?;
        for (i, step) in f.steps.iter().enumerate() {
            writeln!(w, "    {}. {step}", i + 1)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;

    use agentforge_core::model::{FeatureStatus, GraphEdge, GraphNode, GraphNodeStatus};

    use super::*;

    fn feature() -> Feature {
        Feature {
            id: 7,
            name: "Login form".into(),
            description: String::new(),
            category: "auth".into(),
            steps: vec!["open /login".into(), "submit".into()],
            priority: Priority::P2,
            status: FeatureStatus::InProgress,
            dependencies: BTreeSet::from([3, 5]),
            claimed_by: Some("coding-1".into()),
            claimed_at: Some(0),
            failure_count: 0,
            last_tested_at: None,
            created_at: 0,
            enqueued_at: 0,
        }
    }

    #[test]
    fn table_row_shows_deps_and_claim() {
        let mut buf = Vec::new();
        write_table(&mut buf, &[feature()]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("7 "));
        assert!(row.contains("P2"));
        assert!(row.contains("in_progress"));
        assert!(row.contains("coding-1"));
        assert!(row.ends_with("3,5"));
        assert!(text.ends_with("1 feature(s)\n"));
    }

    #[test]
    fn graph_lists_status_and_edges() {
        let view = GraphView {
            nodes: vec![
                GraphNode {
                    id: 1,
                    name: "schema".into(),
                    category: String::new(),
                    status: GraphNodeStatus::Done,
                    priority: Priority::P3,
                    dependencies: BTreeSet::new(),
                },
                GraphNode {
                    id: 2,
                    name: "api".into(),
                    category: String::new(),
                    status: GraphNodeStatus::Blocked,
                    priority: Priority::P3,
                    dependencies: BTreeSet::from([1]),
                },
            ],
            edges: vec![GraphEdge { source: 1, target: 2 }],
        };
        let mut buf = Vec::new();
        write_graph(&mut buf, &view).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert!(rows[1].contains("done"));
        assert!(rows[2].contains("blocked"));
        assert!(rows[2].ends_with('1'));
        assert!(text.ends_with("2 node(s), 1 edge(s)\n"));
    }

    #[test]
    fn detail_numbers_steps() {
        let mut buf = Vec::new();
        write_detail(&mut buf, &feature()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("    2. submit"));
        assert!(!text.contains("Description"));
    }

    #[test]
    fn import_file_accepts_batch_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.json");
        std::fs::write(
            &path,
            r#"[{"name": "schema"}, {"name": "api", "depends_on_indices": [0], "priority": 1}]"#,
        )
        .unwrap();
        let specs = read_specs(&path).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].depends_on_indices, vec![0]);
        assert_eq!(specs[1].feature.priority, Priority::P1);
    }

    #[test]
    fn import_rejects_non_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.json");
        std::fs::write(&path, r#"{"name": "x"}"#).unwrap();
        assert!(read_specs(&path).is_err());
    }
}
