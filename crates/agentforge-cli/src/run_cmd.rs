//! Run control and observation commands.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use tokio_stream::StreamExt;

use agentforge_core::model::{ControlResponse, RunSettings, RunTrigger};
use agentforge_core::{EventEnvelope, OrchestratorEvent};

use crate::client::DaemonClient;
use crate::fmt::{id_list, timestamp};
use crate::sse::SseParser;

/// Print the run state, feature progress and running agents.
pub async fn status(client: &DaemonClient) -> anyhow::Result<()> {
    let mut out = io::stdout();
    let status = client.status().await?;
    let run = &status.run;

    writeln!(out, "State:     {}", run.state)?;
    if let Some(ref run_id) = run.run_id {
        writeln!(out, "Run:       {run_id}")?;
    }
    if let Some(ref trigger) = run.trigger {
        match trigger {
            RunTrigger::Manual => writeln!(out, "Trigger:   manual")?,
            RunTrigger::Scheduled {
                schedule_id,
                window_end,
                ..
            } => writeln!(
                out,
                "Trigger:   schedule #{schedule_id} (window ends {})",
                timestamp(*window_end)
            )?,
        }
    }
    if let Some(started) = run.started_at {
        writeln!(out, "Started:   {}", timestamp(started))?;
    }
    if let Some(ref settings) = run.settings {
        write_settings(&mut out, settings)?;
    }
    let f = &status.features;
    writeln!(
        out,
        "Features:  {}/{} passing ({:.1}%), {} in progress, {} pending, {} failing",
        f.passing, f.total, f.percentage, f.in_progress, f.pending, f.failing
    )?;
    writeln!(
        out,
        "Agents:    {} running, {} queued",
        run.agents_running, run.spawns_queued
    )?;

    if run.agents_running > 0 {
        let agents = client.agents().await?;
        writeln!(out)?;
        writeln!(
            out,
            "{:<14}  {:<10}  {:<8}  {:<11}  {:<8}  FEATURES",
            "AGENT", "MASCOT", "KIND", "STATE", "RESTARTS"
        )?;
        for agent in &agents {
            writeln!(
                out,
                "{:<14}  {:<10}  {:<8}  {:<11}  {:<8}  {}",
                agent.id,
                agent.mascot,
                if agent.initializer {
                    "init"
                } else {
                    agent.kind.as_str()
                },
                agent.state,
                agent.restart_count,
                id_list(&agent.feature_ids),
            )?;
        }
    }
    Ok(())
}

fn write_settings(w: &mut impl Write, settings: &RunSettings) -> io::Result<()> {
    let mut parts = Vec::new();
    if let Some(n) = settings.max_concurrency {
        parts.push(format!("concurrency={n}"));
    }
    if let Some(ref model) = settings.model {
        parts.push(format!("model={model}"));
    }
    if settings.yolo {
        parts.push("yolo".to_string());
    }
    if !parts.is_empty() {
        writeln!(w, "Settings:  {}", parts.join(" "))?;
    }
    Ok(())
}

pub async fn start(client: &DaemonClient, settings: RunSettings) -> anyhow::Result<()> {
    report(client.start(&settings).await?)
}

pub async fn stop(client: &DaemonClient, reason: Option<&str>) -> anyhow::Result<()> {
    report(client.stop(reason).await?)
}

pub async fn pause(client: &DaemonClient) -> anyhow::Result<()> {
    report(client.pause().await?)
}

pub async fn resume(client: &DaemonClient) -> anyhow::Result<()> {
    report(client.resume().await?)
}

/// Print a control result; a refused control is an error exit.
fn report(resp: ControlResponse) -> anyhow::Result<()> {
    if resp.ok {
        let mut out = io::stdout();
        writeln!(out, "{} (state: {})", resp.message, resp.state)?;
        Ok(())
    } else {
        anyhow::bail!("{} (state: {})", resp.message, resp.state)
    }
}

/// Follow the daemon event stream until it closes.
pub async fn watch(client: &DaemonClient, json: bool) -> anyhow::Result<()> {
    let mut out = io::stdout();
    let resp = client.events().await?;
    let mut body = resp.bytes_stream();
    let mut parser = SseParser::new();
    let mut last_seq: Option<u64> = None;

    while let Some(chunk) = body.next().await {
        for message in parser.push(&chunk?) {
            if json {
                writeln!(out, "{}", message.data)?;
                continue;
            }
            let envelope: EventEnvelope = match serde_json::from_str(&message.data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!(event = %message.event, error = %e, "Unparseable event");
                    continue;
                }
            };
            if let Some(prev) = last_seq
                && envelope.seq > prev + 1
            {
                writeln!(out, "... {} event(s) dropped", envelope.seq - prev - 1)?;
            }
            last_seq = Some(envelope.seq);
            writeln!(
                out,
                "{}  {}",
                timestamp(envelope.timestamp),
                describe(&envelope.event)
            )?;
        }
    }
    writeln!(out, "Event stream closed.")?;
    Ok(())
}

/// One-line human description of an event.
pub fn describe(event: &OrchestratorEvent) -> String {
    use OrchestratorEvent as E;
    match event {
        E::RunStarted {
            run_id, trigger, ..
        } => format!("run {run_id} started ({})", trigger.as_str()),
        E::RunPaused { run_id } => format!("run {run_id} paused"),
        E::RunResumed { run_id } => format!("run {run_id} resumed"),
        E::RunStopped { run_id, reason } => format!("run {run_id} stopped: {reason}"),
        E::RunCompleted { run_id } => format!("run {run_id} completed"),
        E::RunFailed { run_id, reason } => format!("run {run_id} failed: {reason}"),
        E::AgentSpawned {
            agent_id,
            mascot,
            kind,
            feature_ids,
            initializer,
        } => {
            let role = if *initializer { "initializer" } else { kind.as_str() };
            format!(
                "{mascot} ({agent_id}) spawned as {role} on [{}]",
                id_list(feature_ids)
            )
        }
        E::AgentStateChanged {
            agent_id,
            state,
            detail,
        } => match detail {
            Some(detail) => format!("{agent_id} is {state}: {detail}"),
            None => format!("{agent_id} is {state}"),
        },
        E::AgentExited {
            agent_id,
            exit_code,
        } => format!("{agent_id} exited ({})", code(*exit_code)),
        E::AgentCrashed {
            agent_id,
            exit_code,
            signal,
            released,
        } => {
            let how = signal.map_or_else(|| code(*exit_code), |s| format!("signal {s}"));
            format!(
                "{agent_id} crashed ({how}), released [{}]",
                id_list(released)
            )
        }
        E::SpawnQueued { kind, queued } => format!("{kind} spawn queued ({queued} waiting)"),
        E::RestartScheduled {
            attempt,
            delay_ms,
            rate_limited,
        } => format!(
            "restart attempt {attempt} in {delay_ms}ms{}",
            if *rate_limited { " (rate limited)" } else { "" }
        ),
        E::FeatureCreated { feature_id, name } => format!("feature #{feature_id} created: {name}"),
        E::FeatureRemoved { feature_id } => format!("feature #{feature_id} removed"),
        E::FeatureClaimed {
            feature_id,
            agent_id,
        } => format!("feature #{feature_id} claimed by {agent_id}"),
        E::FeaturePassing { feature_id, .. } => format!("feature #{feature_id} passing"),
        E::FeatureFailing {
            feature_id,
            status,
            failure_count,
            ..
        } => format!("feature #{feature_id} failed (attempt {failure_count}, now {status})"),
        E::FeatureReleased { feature_id, status } => {
            format!("feature #{feature_id} released ({status})")
        }
        E::CommandDenied {
            agent_id,
            command,
            reason,
            ..
        } => format!("{agent_id} denied `{command}`: {reason}"),
        E::SandboxViolation {
            agent_id,
            path,
            reason,
        } => format!("{agent_id} sandbox violation at {path}: {reason}"),
        E::ScheduleTriggered {
            schedule_id,
            run_id,
        } => format!("schedule #{schedule_id} started run {run_id}"),
        E::ScheduleWindowClosed { schedule_id } => {
            format!("schedule #{schedule_id} window closed")
        }
        E::ScheduleOccurrenceFailed {
            schedule_id,
            window_start,
        } => format!(
            "schedule #{schedule_id} occurrence at {} failed",
            timestamp(*window_start)
        ),
        E::ScheduleWindowMissed {
            schedule_id,
            window_start,
        } => format!(
            "schedule #{schedule_id} missed window at {}",
            timestamp(*window_start)
        ),
    }
}

fn code(exit_code: Option<i32>) -> String {
    exit_code.map_or_else(|| "no exit code".to_string(), |c| format!("code {c}"))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn describes_crash_with_released_features() {
        let line = describe(&OrchestratorEvent::AgentCrashed {
            agent_id: "coding-1".into(),
            exit_code: Some(1),
            signal: None,
            released: vec![4, 7],
        });
        assert_eq!(line, "coding-1 crashed (code 1), released [4,7]");
    }

    #[test]
    fn describes_signal_over_exit_code() {
        let line = describe(&OrchestratorEvent::AgentCrashed {
            agent_id: "a".into(),
            exit_code: None,
            signal: Some(9),
            released: vec![],
        });
        assert_eq!(line, "a crashed (signal 9), released [-]");
    }

    #[test]
    fn settings_line_lists_overrides() {
        let mut buf = Vec::new();
        write_settings(
            &mut buf,
            &RunSettings {
                max_concurrency: Some(3),
                model: None,
                yolo: true,
            },
        )
        .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "Settings:  concurrency=3 yolo\n");
    }

    #[test]
    fn refused_control_is_an_error() {
        let resp = ControlResponse {
            ok: false,
            state: agentforge_core::model::RunState::Running,
            message: "a run is already active".into(),
        };
        assert!(report(resp).is_err());
    }
}
