//! `agentforge policy check`: evaluate a command line against the policy.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::Path;

use agentforge_core::config::load_config;
use agentforge_core::{Decision, PolicyEngine};

use crate::client::DaemonClient;

/// Evaluate locally from the project's policy files.
pub fn check_local(project: &Path, command: &str) -> anyhow::Result<Decision> {
    let config = load_config(Some(project))?;
    let engine = PolicyEngine::load(project, config.policy.org_policy_path().as_deref());
    let mut err = io::stderr();
    for issue in engine.issues() {
        writeln!(err, "warning: {issue}")?;
    }
    Ok(engine.evaluate(command))
}

/// Evaluate with the daemon's loaded policy.
pub async fn check_remote(client: &DaemonClient, command: &str) -> anyhow::Result<Decision> {
    Ok(client.evaluate(command).await?)
}

pub fn write_decision(w: &mut impl Write, command: &str, decision: &Decision) -> io::Result<()> {
    match decision {
        Decision::Allow { tier, pattern } => {
            writeln!(w, "ALLOW  {command}")?;
            writeln!(w, "  matched {pattern} ({tier})")
        }
        Decision::Deny {
            reason,
            tier,
            pattern,
        } => {
            writeln!(w, "DENY   {command}")?;
            writeln!(w, "  {reason}")?;
            match (pattern, tier) {
                (Some(pattern), Some(tier)) => writeln!(w, "  matched {pattern} ({tier})"),
                _ => Ok(()),
            }
        }
    }
}
