//! Run lifecycle.
//!
//! The [`Orchestrator`] owns at most one run at a time. Each run is driven by
//! a single control-loop task (see `control`) that claims features, asks the
//! supervisor for agents and reacts to agent exits. Control operations only
//! flip the run state and signal the loop through a `watch` channel.

mod control;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, broadcast, watch};
use tracing::info;
use uuid::Uuid;

use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{ControlResponse, RunSettings, RunState, RunStatus, RunTrigger};
use agentforge_core::{Config, EventEnvelope, OrchestratorEvent};

use crate::claims::{ClaimError, ClaimStore};
use crate::events::EventBus;
use crate::project::ProjectContext;
use crate::storage::DatabaseError;
use crate::supervisor::{Supervisor, SupervisorError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Run {run_id} is already active")]
    AlreadyRunning { run_id: String },

    #[error("No run is active")]
    NotRunning,

    #[error("Cannot {action} while {state}")]
    InvalidState {
        state: RunState,
        action: &'static str,
    },

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Loop tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub features_per_agent: usize,
    pub idle_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_attempts: u32,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            features_per_agent: config.orchestrator.features_per_agent.max(1),
            idle_interval: Duration::from_millis(config.orchestrator.idle_interval_ms.max(1)),
            retry_base_delay: Duration::from_millis(config.retry.base_delay_ms),
            retry_max_attempts: config.retry.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop(String),
}

struct ActiveRun {
    id: String,
    trigger: RunTrigger,
    settings: RunSettings,
    started_at: i64,
    state: RunState,
    control: watch::Sender<Control>,
}

struct Inner {
    project: Arc<ProjectContext>,
    claims: Arc<ClaimStore>,
    supervisor: Supervisor,
    events: EventBus,
    settings: OrchestratorSettings,
    current: Mutex<Option<ActiveRun>>,
    /// Signalled when a run ends.
    finished: Notify,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        project: Arc<ProjectContext>,
        claims: Arc<ClaimStore>,
        supervisor: Supervisor,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                project,
                claims,
                supervisor,
                events,
                settings,
                current: Mutex::new(None),
                finished: Notify::new(),
            }),
        }
    }

    pub fn project(&self) -> &ProjectContext {
        &self.inner.project
    }

    pub fn claims(&self) -> &Arc<ClaimStore> {
        &self.inner.claims
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    /// Begin a run. Fails if one is already active.
    pub async fn start(
        &self,
        settings: RunSettings,
        trigger: RunTrigger,
    ) -> Result<RunStatus, OrchestratorError> {
        let inner = &self.inner;
        let mut current = inner.current.lock().await;
        if let Some(run) = current.as_ref() {
            return Err(OrchestratorError::AlreadyRunning {
                run_id: run.id.clone(),
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let started_at = unix_timestamp();
        inner
            .claims
            .database()
            .insert_run(&run_id, &trigger, &settings, started_at)
            .await?;

        inner
            .supervisor
            .set_run_limit(settings.max_concurrency.map(usize::from));
        let stale = inner.supervisor.drain_exits().await;
        if stale > 0 {
            info!(stale, "Discarded exit reports from a previous run");
        }

        let (control_tx, control_rx) = watch::channel(Control::Run);
        *current = Some(ActiveRun {
            id: run_id.clone(),
            trigger: trigger.clone(),
            settings: settings.clone(),
            started_at,
            state: RunState::Running,
            control: control_tx,
        });

        info!(
            run_id = %run_id,
            trigger = trigger.as_str(),
            max_concurrency = ?settings.max_concurrency,
            yolo = settings.yolo,
            "Run started"
        );
        inner.events.publish(OrchestratorEvent::RunStarted {
            run_id: run_id.clone(),
            trigger: trigger.clone(),
            settings: settings.clone(),
        });

        tokio::spawn(control::run_loop(
            Arc::clone(inner),
            control::RunContext {
                run_id,
                trigger,
                settings,
            },
            control_rx,
        ));

        Ok(self.status_of(current.as_ref()).await)
    }

    /// Ask the active run to stop. Agents are terminated and their claims
    /// released by the control loop; this returns immediately.
    pub async fn stop(&self, reason: &str) -> Result<RunStatus, OrchestratorError> {
        let mut current = self.inner.current.lock().await;
        let run = current.as_mut().ok_or(OrchestratorError::NotRunning)?;
        if run.state != RunState::Stopping {
            info!(run_id = %run.id, reason, "Stopping run");
            run.state = RunState::Stopping;
            run.control.send_replace(Control::Stop(reason.to_string()));
        }
        Ok(self.status_of(current.as_ref()).await)
    }

    /// Stop claiming and spawning. Running agents continue.
    pub async fn pause(&self) -> Result<RunStatus, OrchestratorError> {
        let mut current = self.inner.current.lock().await;
        let run = current.as_mut().ok_or(OrchestratorError::NotRunning)?;
        if run.state != RunState::Running {
            return Err(OrchestratorError::InvalidState {
                state: run.state,
                action: "pause",
            });
        }
        run.state = RunState::Paused;
        run.control.send_replace(Control::Pause);
        self.inner.supervisor.pause();
        info!(run_id = %run.id, "Run paused");
        self.inner.events.publish(OrchestratorEvent::RunPaused {
            run_id: run.id.clone(),
        });
        Ok(self.status_of(current.as_ref()).await)
    }

    pub async fn resume(&self) -> Result<RunStatus, OrchestratorError> {
        let mut current = self.inner.current.lock().await;
        let run = current.as_mut().ok_or(OrchestratorError::NotRunning)?;
        if run.state != RunState::Paused {
            return Err(OrchestratorError::InvalidState {
                state: run.state,
                action: "resume",
            });
        }
        run.state = RunState::Running;
        run.control.send_replace(Control::Run);
        self.inner.supervisor.resume().await;
        info!(run_id = %run.id, "Run resumed");
        self.inner.events.publish(OrchestratorEvent::RunResumed {
            run_id: run.id.clone(),
        });
        Ok(self.status_of(current.as_ref()).await)
    }

    pub async fn status(&self) -> RunStatus {
        let current = self.inner.current.lock().await;
        self.status_of(current.as_ref()).await
    }

    /// Wait until no run is active.
    pub async fn wait_idle(&self) {
        loop {
            let finished = self.inner.finished.notified();
            if self.inner.current.lock().await.is_none() {
                return;
            }
            finished.await;
        }
    }

    async fn status_of(&self, run: Option<&ActiveRun>) -> RunStatus {
        let Some(run) = run else {
            return RunStatus::idle();
        };
        RunStatus {
            state: run.state,
            run_id: Some(run.id.clone()),
            trigger: Some(run.trigger.clone()),
            settings: Some(run.settings.clone()),
            started_at: Some(run.started_at),
            agents_running: self.inner.supervisor.running_total(),
            spawns_queued: self.inner.supervisor.queued().await,
        }
    }
}

/// Map a control result onto the response body used by the API.
pub fn control_response(
    result: Result<RunStatus, OrchestratorError>,
    done: &str,
) -> ControlResponse {
    match result {
        Ok(status) => ControlResponse {
            ok: true,
            state: status.state,
            message: done.to_string(),
        },
        Err(e) => ControlResponse {
            ok: false,
            state: match &e {
                OrchestratorError::InvalidState { state, .. } => *state,
                OrchestratorError::AlreadyRunning { .. } => RunState::Running,
                _ => RunState::Idle,
            },
            message: e.to_string(),
        },
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;
    use std::path::PathBuf;

    use agentforge_core::PolicyEngine;
    use agentforge_core::model::{FeatureStatus, NewFeature};

    use crate::storage::Database;
    use crate::supervisor::SupervisorConfig;

    const REPORT_PASSING: &str = r#"for id in $(echo "$AGENTFORGE_FEATURE_IDS" | tr ',' ' '); do echo "{\"type\":\"feature_result\",\"feature_id\":$id,\"outcome\":\"passing\"}"; done"#;

    async fn orchestrator(dir: &tempfile::TempDir, script: &str) -> Orchestrator {
        let project = Arc::new(ProjectContext::open(dir.path()).unwrap());
        let events = EventBus::new();
        let db = Database::open_in_memory().await.unwrap();
        let claims = Arc::new(ClaimStore::load(db, events.clone(), 3).await.unwrap());
        let config = SupervisorConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            default_model: "test-model".to_string(),
            project_dir: project.root().to_path_buf(),
            data_dir: project.data_dir().to_path_buf(),
            extra_read_paths: Vec::new(),
            coding_limit: 2,
            testing_per_coding: 1,
            terminate_timeout: Duration::from_secs(1),
        };
        let policy = Arc::new(PolicyEngine::new(Some(project.root().to_path_buf())));
        let supervisor = Supervisor::new(config, Arc::clone(&claims), policy, events.clone());
        let settings = OrchestratorSettings {
            features_per_agent: 1,
            idle_interval: Duration::from_millis(50),
            retry_base_delay: Duration::from_millis(5),
            retry_max_attempts: 3,
        };
        Orchestrator::new(project, claims, supervisor, events, settings)
    }

    async fn wait_idle(orch: &Orchestrator) {
        tokio::time::timeout(Duration::from_secs(20), orch.wait_idle())
            .await
            .expect("run did not finish");
    }

    #[tokio::test]
    async fn run_completes_when_all_features_pass() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, REPORT_PASSING).await;
        let a = orch.claims().create_feature(NewFeature::named("a")).await.unwrap();
        orch.claims()
            .create_feature(NewFeature::named("b").depends_on([a.id]))
            .await
            .unwrap();
        let mut rx = orch.subscribe();

        let status = orch
            .start(
                RunSettings {
                    yolo: true,
                    ..RunSettings::default()
                },
                RunTrigger::Manual,
            )
            .await
            .unwrap();
        assert_eq!(status.state, RunState::Running);
        wait_idle(&orch).await;

        assert!(orch.claims().all_passing().await);
        assert_eq!(orch.status().await, RunStatus::idle());

        let mut names = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            names.push(envelope.event.name());
        }
        assert_eq!(names.first(), Some(&"run_started"));
        assert_eq!(names.last(), Some(&"run_completed"));
        assert!(names.contains(&"feature_passing"));

        let runs = orch.claims().database().list_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "completed");
    }

    #[tokio::test]
    async fn blocked_run_waits_for_new_work() {
        // Feature 1 always fails; everything else passes.
        let script = r#"for id in $(echo "$AGENTFORGE_FEATURE_IDS" | tr ',' ' '); do if [ "$id" = 1 ]; then outcome=failing; else outcome=passing; fi; echo "{\"type\":\"feature_result\",\"feature_id\":$id,\"outcome\":\"$outcome\"}"; done"#;
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, script).await;
        let a = orch.claims().create_feature(NewFeature::named("a")).await.unwrap();
        assert_eq!(a.id, 1);
        let b = orch
            .claims()
            .create_feature(NewFeature::named("b").depends_on([a.id]))
            .await
            .unwrap();

        orch.start(
            RunSettings {
                yolo: true,
                ..RunSettings::default()
            },
            RunTrigger::Manual,
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(20), async {
            while orch.claims().get(a.id).await.unwrap().status != FeatureStatus::Failing {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("feature was never parked");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(orch.status().await.state, RunState::Running);
        assert_eq!(
            orch.claims().get(b.id).await.unwrap().status,
            FeatureStatus::Pending
        );

        orch.claims()
            .set_dependencies(b.id, BTreeSet::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(20), async {
            while orch.claims().get(b.id).await.unwrap().status != FeatureStatus::Passing {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("unblocked feature was never picked up");
        assert_eq!(orch.status().await.state, RunState::Running);

        orch.stop("done").await.unwrap();
        wait_idle(&orch).await;
        let runs = orch.claims().database().list_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "stopped");
    }

    #[tokio::test]
    async fn initializer_populates_empty_store() {
        let script = format!(
            r#"if [ "$AGENTFORGE_INITIALIZER" = 1 ]; then echo '{{"type":"create_features","features":[{{"name":"a"}},{{"name":"b","depends_on_indices":[0]}}]}}'; read reply; exit 0; fi; {REPORT_PASSING}"#
        );
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, &script).await;

        orch.start(RunSettings::default(), RunTrigger::Manual)
            .await
            .unwrap();
        wait_idle(&orch).await;

        let features = orch.claims().list().await;
        assert_eq!(features.len(), 2);
        assert!(features.iter().all(|f| f.status == FeatureStatus::Passing));
    }

    #[tokio::test]
    async fn empty_initializer_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, "exit 0").await;
        orch.start(RunSettings::default(), RunTrigger::Manual)
            .await
            .unwrap();
        wait_idle(&orch).await;
        let runs = orch.claims().database().list_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "failed");
    }

    #[tokio::test]
    async fn control_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, "sleep 30").await;
        let feature = orch.claims().create_feature(NewFeature::named("slow")).await.unwrap();

        assert!(matches!(
            orch.pause().await,
            Err(OrchestratorError::NotRunning)
        ));
        orch.start(RunSettings::default(), RunTrigger::Manual)
            .await
            .unwrap();
        assert!(matches!(
            orch.start(RunSettings::default(), RunTrigger::Manual).await,
            Err(OrchestratorError::AlreadyRunning { .. })
        ));
        assert!(matches!(
            orch.resume().await,
            Err(OrchestratorError::InvalidState { .. })
        ));

        assert_eq!(orch.pause().await.unwrap().state, RunState::Paused);
        assert!(orch.supervisor().is_paused());
        assert_eq!(orch.resume().await.unwrap().state, RunState::Running);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            orch.claims().get(feature.id).await.unwrap().status,
            FeatureStatus::InProgress
        );

        assert_eq!(orch.stop("test").await.unwrap().state, RunState::Stopping);
        wait_idle(&orch).await;

        let after = orch.claims().get(feature.id).await.unwrap();
        assert_eq!(after.status, FeatureStatus::Pending);
        assert!(after.claimed_by.is_none());
        assert!(orch.supervisor().agents().await.is_empty());
        assert!(!orch.supervisor().is_paused());

        let runs = orch.claims().database().list_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "stopped");
        assert_eq!(runs[0].reason.as_deref(), Some("test"));
    }

    #[tokio::test]
    async fn scheduled_run_fails_after_repeated_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, "exit 3").await;
        let feature = orch.claims().create_feature(NewFeature::named("crashy")).await.unwrap();

        orch.start(
            RunSettings::default(),
            RunTrigger::Scheduled {
                schedule_id: 1,
                window_start: 0,
                window_end: i64::MAX,
            },
        )
        .await
        .unwrap();
        wait_idle(&orch).await;

        let runs = orch.claims().database().list_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "failed");
        let after = orch.claims().get(feature.id).await.unwrap();
        assert_eq!(after.status, FeatureStatus::Pending);
        assert!(after.claimed_by.is_none());
    }

    #[test]
    fn control_response_reports_errors() {
        let response = control_response(Err(OrchestratorError::NotRunning), "stopped");
        assert!(!response.ok);
        assert_eq!(response.state, RunState::Idle);
    }
}
