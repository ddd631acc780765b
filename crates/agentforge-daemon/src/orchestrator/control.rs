//! The per-run control loop.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use agentforge_core::model::{AgentKind, RunSettings, RunState, RunTrigger};
use agentforge_core::{ErrorKind, OrchestratorEvent, SandboxConfig};

use super::{Control, Inner, OrchestratorError};
use crate::storage::RunOutcome;
use crate::supervisor::{
    AgentExit, ExitOutcome, RestartDecision, RestartMode, RestartTracker, SpawnRequest,
    SupervisorError,
};

pub(super) struct RunContext {
    pub(super) run_id: String,
    pub(super) trigger: RunTrigger,
    pub(super) settings: RunSettings,
}

/// How a run ended.
type Finish = (RunOutcome, Option<String>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitializerPhase {
    NotStarted,
    Running,
    Done,
}

pub(super) async fn run_loop(
    inner: Arc<Inner>,
    run: RunContext,
    mut control: watch::Receiver<Control>,
) {
    let (outcome, reason) = drive(&inner, &run, &mut control).await;
    finish(&inner, &run, outcome, reason).await;
}

async fn drive(inner: &Inner, run: &RunContext, control: &mut watch::Receiver<Control>) -> Finish {
    let mode = if run.trigger.is_scheduled() {
        RestartMode::Scheduled {
            base_delay: inner.settings.retry_base_delay,
            max_attempts: inner.settings.retry_max_attempts,
        }
    } else {
        RestartMode::Manual
    };
    let mut restarts = RestartTracker::new(mode);
    let mut initializer = InitializerPhase::NotStarted;
    let sandbox = inner.supervisor.config().sandbox();

    loop {
        let state = control.borrow_and_update().clone();
        if let Control::Stop(reason) = state {
            return (RunOutcome::Stopped, Some(reason));
        }

        let gate = restarts.gate_remaining(Instant::now());
        if state == Control::Run && gate.is_none() {
            match step(inner, run, &sandbox, &mut initializer, &restarts).await {
                Ok(Some(finish)) => return finish,
                Ok(None) => {}
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "Control loop failed");
                    return (RunOutcome::Failed, Some(e.to_string()));
                }
            }
        }

        let wait = gate.map_or(inner.settings.idle_interval, |g| {
            g.min(inner.settings.idle_interval)
        });
        tokio::select! {
            exit = inner.supervisor.next_exit() => {
                if let Some(exit) = exit
                    && let Some(finish) = on_exit(inner, run, &mut restarts, &mut initializer, &exit)
                {
                    return finish;
                }
            }
            () = tokio::time::sleep(wait) => {}
            changed = control.changed() => {
                if changed.is_err() {
                    return (RunOutcome::Stopped, Some("orchestrator dropped".to_string()));
                }
            }
        }
    }
}

/// One pass of claiming and spawning.
async fn step(
    inner: &Inner,
    run: &RunContext,
    sandbox: &SandboxConfig,
    initializer: &mut InitializerPhase,
    restarts: &RestartTracker,
) -> Result<Option<Finish>, OrchestratorError> {
    let claims = &inner.claims;
    let supervisor = &inner.supervisor;
    let request = |kind: AgentKind| {
        SpawnRequest::new(kind, Vec::new(), sandbox.clone())
            .with_settings(run.settings.clone())
            .with_restart_count(restarts.crashes())
    };

    if claims.is_empty().await {
        match *initializer {
            InitializerPhase::Running => return Ok(None),
            InitializerPhase::Done => {
                return Ok(Some((
                    RunOutcome::Failed,
                    Some("initializer produced no features".to_string()),
                )));
            }
            InitializerPhase::NotStarted => {
                if !supervisor.can_spawn(AgentKind::Coding) {
                    return Ok(None);
                }
                let initializer_request = SpawnRequest {
                    initializer: true,
                    ..request(AgentKind::Coding)
                };
                match supervisor.spawn(initializer_request).await {
                    Ok(info) => {
                        info!(run_id = %run.run_id, agent_id = %info.id, "Initializer spawned");
                    }
                    Err(SupervisorError::ConcurrencyExceeded { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                *initializer = InitializerPhase::Running;
                return Ok(None);
            }
        }
    }
    if *initializer == InitializerPhase::Running {
        return Ok(None);
    }

    while supervisor.can_spawn(AgentKind::Coding) {
        let mut next = request(AgentKind::Coding);
        let claimed = claims
            .claim(&next.agent_id, inner.settings.features_per_agent)
            .await?;
        if claimed.is_empty() {
            break;
        }
        next.feature_ids = claimed.iter().map(|f| f.id).collect();
        if !spawn_or_release(inner, next).await? {
            break;
        }
    }

    if claims.all_passing().await {
        return Ok(Some((RunOutcome::Completed, None)));
    }
    // Blocked or parked work keeps the run alive; a retry, dependency edit
    // or new feature is picked up on a later pass.
    if supervisor.running_total() == 0 && supervisor.queued().await == 0 {
        debug!(run_id = %run.run_id, "No claimable features, waiting for new work");
    }

    if !run.settings.yolo {
        while supervisor.can_spawn(AgentKind::Testing) {
            let mut next = request(AgentKind::Testing);
            let claimed = claims.claim_for_regression(&next.agent_id, 1).await?;
            if claimed.is_empty() {
                break;
            }
            next.feature_ids = claimed.iter().map(|f| f.id).collect();
            if !spawn_or_release(inner, next).await? {
                break;
            }
        }
    }
    Ok(None)
}

/// `Ok(true)` when the agent started, `Ok(false)` when it was queued.
/// Any other spawn failure gives the claims back.
async fn spawn_or_release(inner: &Inner, request: SpawnRequest) -> Result<bool, OrchestratorError> {
    let agent_id = request.agent_id.clone();
    match inner.supervisor.spawn(request).await {
        Ok(info) => {
            debug!(agent_id = %info.id, kind = info.kind.as_str(), features = ?info.feature_ids, "Agent started");
            Ok(true)
        }
        Err(SupervisorError::ConcurrencyExceeded { .. }) => Ok(false),
        Err(e) => {
            inner.claims.release_agent(&agent_id).await?;
            Err(e.into())
        }
    }
}

fn on_exit(
    inner: &Inner,
    run: &RunContext,
    restarts: &mut RestartTracker,
    initializer: &mut InitializerPhase,
    exit: &AgentExit,
) -> Option<Finish> {
    if exit.initializer {
        *initializer = if exit.outcome.is_crash() {
            InitializerPhase::NotStarted
        } else {
            InitializerPhase::Done
        };
    }
    if !exit.outcome.is_crash() {
        if exit.outcome == ExitOutcome::Clean {
            restarts.record_success();
        }
        return None;
    }

    match restarts.record_crash(exit.rate_limit, Instant::now()) {
        RestartDecision::Retry {
            attempt,
            delay,
            rate_limited,
        } => {
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            warn!(
                run_id = %run.run_id,
                agent_id = %exit.agent_id,
                attempt,
                delay_ms,
                rate_limited,
                "Agent crashed, restart scheduled"
            );
            inner.events.publish(OrchestratorEvent::RestartScheduled {
                attempt,
                delay_ms,
                rate_limited,
            });
            None
        }
        RestartDecision::Exhausted { attempts } => {
            error!(
                run_id = %run.run_id,
                kind = ErrorKind::AgentCrashed.as_str(),
                attempts,
                "Restart attempts exhausted"
            );
            Some((
                RunOutcome::Failed,
                Some(format!("agents crashed {attempts} times")),
            ))
        }
    }
}

async fn finish(inner: &Inner, run: &RunContext, outcome: RunOutcome, reason: Option<String>) {
    {
        let mut current = inner.current.lock().await;
        if let Some(active) = current.as_mut()
            && active.id == run.run_id
        {
            active.state = RunState::Stopping;
        }
    }

    inner.supervisor.stop().await;
    inner.supervisor.set_run_limit(None);
    if inner.supervisor.is_paused() {
        inner.supervisor.resume().await;
    }

    if let Err(e) = inner
        .claims
        .database()
        .finish_run(&run.run_id, outcome, reason.as_deref())
        .await
    {
        error!(run_id = %run.run_id, error = %e, "Failed to record run end");
    }

    let run_id = run.run_id.clone();
    let event = match outcome {
        RunOutcome::Completed => {
            info!(run_id = %run_id, reason = ?reason, "Run completed");
            OrchestratorEvent::RunCompleted { run_id }
        }
        RunOutcome::Stopped => {
            let reason = reason.unwrap_or_else(|| "stopped".to_string());
            info!(run_id = %run_id, reason = %reason, "Run stopped");
            OrchestratorEvent::RunStopped { run_id, reason }
        }
        RunOutcome::Failed => {
            let reason = reason.unwrap_or_else(|| "failed".to_string());
            error!(run_id = %run_id, reason = %reason, "Run failed");
            OrchestratorEvent::RunFailed { run_id, reason }
        }
    };
    inner.events.publish(event);

    {
        let mut current = inner.current.lock().await;
        if current.as_ref().is_some_and(|a| a.id == run.run_id) {
            *current = None;
        }
    }
    inner.finished.notify_waiters();
}
