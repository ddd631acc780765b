//! Agent process supervisor.
//!
//! Spawns coding and testing agents as subprocesses, enforces concurrency
//! ceilings through [`AgentSlots`], queues spawn requests that do not fit,
//! answers agent requests over the NDJSON protocol and releases claims when
//! an agent exits. Exits are reported to the orchestrator as [`AgentExit`]
//! values so restart policy stays out of this module.

mod backoff;
mod process;
mod protocol;
mod session;
mod slots;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{AgentInfo, AgentKind, AgentState, FeatureId, RunSettings};
use agentforge_core::{
    Config, ErrorKind, OrchestratorEvent, PolicyEngine, SandboxConfig, SandboxPolicy,
    SandboxViolation,
};

use crate::claims::ClaimStore;
use crate::events::EventBus;

pub use backoff::{RateLimitSignal, RestartDecision, RestartMode, RestartTracker};
pub use process::ExitOutcome;
pub use protocol::{AgentMessage, AgentReply};
pub use slots::{AgentSlots, SlotPermit, SlotsExhausted};

use session::AgentSession;

/// Display names handed out round-robin.
pub const MASCOTS: &[&str] = &[
    "Spark", "Fizz", "Octo", "Hoot", "Buzz", "Pixel", "Byte", "Nova", "Chip", "Bolt",
];

const STDIN_CHANNEL_CAPACITY: usize = 32;

/// How long to wait for reader tasks after the process is gone.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra time `stop` allows beyond the termination grace period.
const STOP_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{kind} agent limit reached ({running}/{limit}); request queued")]
    ConcurrencyExceeded {
        kind: AgentKind,
        running: usize,
        limit: usize,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),

    #[error("Failed to spawn agent: {reason}")]
    SpawnFailed { reason: String },

    #[error("Supervisor is stopping")]
    Stopping,

    #[error("Agent not found: {id}")]
    NotFound { id: String },
}

impl SupervisorError {
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::ConcurrencyExceeded { .. } => Some(ErrorKind::ConcurrencyExceeded),
            Self::Sandbox(_) => Some(ErrorKind::SandboxViolation),
            _ => None,
        }
    }
}

/// Static supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub default_model: String,
    pub project_dir: PathBuf,
    /// Per-agent sandbox files go under `<data_dir>/sandbox/`.
    pub data_dir: PathBuf,
    pub extra_read_paths: Vec<PathBuf>,
    pub coding_limit: usize,
    pub testing_per_coding: usize,
    pub terminate_timeout: Duration,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config, project_dir: &Path, data_dir: &Path) -> Self {
        Self {
            program: config.agent.program.clone(),
            args: config.agent.args.clone(),
            default_model: config.agent.default_model.clone(),
            project_dir: project_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            extra_read_paths: config.sandbox.extra_read_paths.clone(),
            coding_limit: config.orchestrator.coding_limit(),
            testing_per_coding: config.orchestrator.testing_agents_per_coding,
            terminate_timeout: Duration::from_secs(config.orchestrator.terminate_timeout_secs),
        }
    }

    /// Sandbox rooted at the project with the configured extra read paths.
    pub fn sandbox(&self) -> SandboxConfig {
        SandboxConfig::new(&self.project_dir).with_read_paths(self.extra_read_paths.iter().cloned())
    }
}

/// Everything needed to start one agent.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Assigned up front so features can be claimed before the spawn.
    pub agent_id: String,
    pub kind: AgentKind,
    /// Features already claimed for this agent.
    pub feature_ids: Vec<FeatureId>,
    pub sandbox: SandboxConfig,
    pub initializer: bool,
    pub settings: RunSettings,
    /// Crashes so far in the run, shown on the agent card.
    pub restart_count: u32,
}

impl SpawnRequest {
    pub fn new(kind: AgentKind, feature_ids: Vec<FeatureId>, sandbox: SandboxConfig) -> Self {
        Self {
            agent_id: Uuid::new_v4().to_string(),
            kind,
            feature_ids,
            sandbox,
            initializer: false,
            settings: RunSettings::default(),
            restart_count: 0,
        }
    }

    /// Coding agent that turns the project description into features.
    pub fn initializer(sandbox: SandboxConfig) -> Self {
        Self {
            initializer: true,
            ..Self::new(AgentKind::Coding, Vec::new(), sandbox)
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub const fn with_restart_count(mut self, restart_count: u32) -> Self {
        self.restart_count = restart_count;
        self
    }
}

/// Report of one finished agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub agent_id: String,
    pub kind: AgentKind,
    pub initializer: bool,
    pub outcome: ExitOutcome,
    pub rate_limit: Option<RateLimitSignal>,
    /// Features that were still claimed and went back to `pending`.
    pub released: Vec<FeatureId>,
}

struct AgentHandle {
    info: AgentInfo,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    config: SupervisorConfig,
    slots: AgentSlots,
    claims: Arc<ClaimStore>,
    policy: Arc<PolicyEngine>,
    events: EventBus,
    agents: RwLock<HashMap<String, AgentHandle>>,
    queue: Mutex<VecDeque<SpawnRequest>>,
    paused: AtomicBool,
    stopping: AtomicBool,
    spawned: AtomicUsize,
    exit_tx: mpsc::UnboundedSender<AgentExit>,
    exit_rx: Mutex<mpsc::UnboundedReceiver<AgentExit>>,
    /// Signalled whenever an agent is removed.
    exited: Notify,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        claims: Arc<ClaimStore>,
        policy: Arc<PolicyEngine>,
        events: EventBus,
    ) -> Self {
        let slots = AgentSlots::new(config.coding_limit, config.testing_per_coding);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                slots,
                claims,
                policy,
                events,
                agents: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                paused: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                spawned: AtomicUsize::new(0),
                exit_tx,
                exit_rx: Mutex::new(exit_rx),
                exited: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn slots(&self) -> &AgentSlots {
        &self.inner.slots
    }

    pub fn claims(&self) -> &Arc<ClaimStore> {
        &self.inner.claims
    }

    /// Start an agent now, or queue the request if a ceiling is hit.
    ///
    /// A queued request keeps its feature claims and is started FIFO when a
    /// slot frees up. The caller still gets `ConcurrencyExceeded` so it can
    /// tell the two apart.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<AgentInfo, SupervisorError> {
        self.inner.spawn(request).await
    }

    /// Whether a spawn of `kind` would start immediately.
    pub fn can_spawn(&self, kind: AgentKind) -> bool {
        !self.inner.stopping.load(Ordering::Acquire) && self.inner.slots.can_reserve(kind)
    }

    pub fn running(&self, kind: AgentKind) -> usize {
        self.inner.slots.running(kind)
    }

    pub fn running_total(&self) -> usize {
        self.inner.slots.total()
    }

    /// Narrow the coding ceiling for the current run.
    pub fn set_run_limit(&self, limit: Option<usize>) {
        self.inner.slots.set_run_limit(limit);
    }

    pub async fn agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .map(|h| h.info.clone())
            .collect();
        agents.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.inner
            .agents
            .read()
            .await
            .get(agent_id)
            .map(|h| h.info.clone())
    }

    /// Number of queued spawn requests.
    pub async fn queued(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// SIGTERM one agent, escalating to SIGKILL after the grace period.
    /// Its claims are released when it exits; the exit is not a crash.
    pub async fn terminate(&self, agent_id: &str) -> Result<(), SupervisorError> {
        let mut agents = self.inner.agents.write().await;
        let handle = agents
            .get_mut(agent_id)
            .ok_or_else(|| SupervisorError::NotFound {
                id: agent_id.to_string(),
            })?;
        if let Some(tx) = handle.kill_tx.take() {
            info!(agent_id, "Terminating agent");
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Stop draining the spawn queue. Running agents continue.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
    }

    pub async fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.drain_queue().await;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Drop queued requests (releasing their claims), terminate every agent
    /// and wait for all of them to exit.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::Release);

        let queued: Vec<SpawnRequest> = inner.queue.lock().await.drain(..).collect();
        for request in &queued {
            inner.release_request(request).await;
        }

        let terminating = {
            let mut agents = inner.agents.write().await;
            let mut count = 0usize;
            for handle in agents.values_mut() {
                if let Some(tx) = handle.kill_tx.take() {
                    let _ = tx.send(());
                    count += 1;
                }
            }
            count
        };
        info!(terminating, dropped = queued.len(), "Stopping all agents");

        let wait_all = async {
            loop {
                let exited = inner.exited.notified();
                if inner.agents.read().await.is_empty() {
                    break;
                }
                exited.await;
            }
        };
        if tokio::time::timeout(inner.config.terminate_timeout + STOP_SLACK, wait_all)
            .await
            .is_err()
        {
            warn!("Timed out waiting for agents to exit");
        }
        inner.stopping.store(false, Ordering::Release);
    }

    /// Next exit report, in exit order.
    pub async fn next_exit(&self) -> Option<AgentExit> {
        self.inner.exit_rx.lock().await.recv().await
    }

    /// Discard exit reports left over from earlier runs.
    pub async fn drain_exits(&self) -> usize {
        let mut rx = self.inner.exit_rx.lock().await;
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

impl Inner {
    async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<AgentInfo, SupervisorError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(SupervisorError::Stopping);
        }
        match self.slots.try_reserve(request.kind) {
            Ok(permit) => self.launch(request, permit).await,
            Err(full) => {
                let queued = {
                    let mut queue = self.queue.lock().await;
                    queue.push_back(request);
                    queue.len()
                };
                info!(
                    kind = full.kind.as_str(),
                    running = full.running,
                    limit = full.limit,
                    queued,
                    "Agent limit reached, spawn queued"
                );
                self.events.publish(OrchestratorEvent::SpawnQueued {
                    kind: full.kind,
                    queued,
                });
                Err(SupervisorError::ConcurrencyExceeded {
                    kind: full.kind,
                    running: full.running,
                    limit: full.limit,
                })
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        request: SpawnRequest,
        permit: SlotPermit,
    ) -> Result<AgentInfo, SupervisorError> {
        let sandbox = SandboxPolicy::new(&request.sandbox)?;
        let agent_id = request.agent_id.clone();

        for rejected in sandbox.rejected() {
            self.events.publish(OrchestratorEvent::SandboxViolation {
                agent_id: agent_id.clone(),
                path: rejected.path.display().to_string(),
                reason: rejected.reason.clone(),
            });
        }

        let sandbox_file = self
            .config
            .data_dir
            .join("sandbox")
            .join(format!("{agent_id}.json"));
        if let Some(parent) = sandbox_file.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SupervisorError::SpawnFailed {
                reason: format!("cannot create sandbox directory: {e}"),
            })?;
        }
        sandbox
            .write_settings_file(&sandbox_file)
            .map_err(|e| SupervisorError::SpawnFailed {
                reason: format!("cannot write sandbox settings: {e}"),
            })?;

        let model = request
            .settings
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let feature_list = request
            .feature_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(sandbox.root())
            .env("AGENTFORGE_AGENT_ID", &agent_id)
            .env("AGENTFORGE_AGENT_KIND", request.kind.as_str())
            .env("AGENTFORGE_FEATURE_IDS", &feature_list)
            .env("AGENTFORGE_PROJECT_DIR", sandbox.root())
            .env("AGENTFORGE_SANDBOX_FILE", &sandbox_file)
            .env("AGENTFORGE_MODEL", &model)
            .env("AGENTFORGE_YOLO", if request.settings.yolo { "1" } else { "0" })
            .env(
                "AGENTFORGE_INITIALIZER",
                if request.initializer { "1" } else { "0" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            agent_id = %agent_id,
            kind = request.kind.as_str(),
            features = %feature_list,
            initializer = request.initializer,
            model = %model,
            "Spawning agent subprocess"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&sandbox_file);
                return Err(SupervisorError::SpawnFailed {
                    reason: format!("{}: {e}", self.config.program.display()),
                });
            }
        };

        let Some(stdin) = child.stdin.take() else {
            let _ = child.start_kill();
            let _ = std::fs::remove_file(&sandbox_file);
            return Err(SupervisorError::SpawnFailed {
                reason: "Failed to capture stdin".to_string(),
            });
        };
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(STDIN_CHANNEL_CAPACITY);
        tokio::spawn(session::write_stdin(stdin, stdin_rx));

        let (kill_tx, kill_rx) = oneshot::channel();
        let seq = self.spawned.fetch_add(1, Ordering::Relaxed);
        let info = AgentInfo {
            id: agent_id.clone(),
            mascot: MASCOTS[seq % MASCOTS.len()].to_string(),
            kind: request.kind,
            state: AgentState::Thinking,
            pid: child.id(),
            feature_ids: request.feature_ids.clone(),
            restart_count: request.restart_count,
            initializer: request.initializer,
            started_at: unix_timestamp(),
        };

        self.agents.write().await.insert(
            agent_id.clone(),
            AgentHandle {
                info: info.clone(),
                kill_tx: Some(kill_tx),
            },
        );
        self.events.publish(OrchestratorEvent::AgentSpawned {
            agent_id: agent_id.clone(),
            mascot: info.mascot.clone(),
            kind: info.kind,
            feature_ids: info.feature_ids.clone(),
            initializer: info.initializer,
        });

        let session = AgentSession {
            inner: Arc::clone(self),
            agent_id,
            kind: request.kind,
            initializer: request.initializer,
            sandbox,
            stdin_tx,
        };
        tokio::spawn(monitor(child, session, permit, kill_rx, sandbox_file));

        Ok(info)
    }

    async fn set_state(&self, agent_id: &str, state: AgentState, detail: Option<String>) {
        {
            let mut agents = self.agents.write().await;
            let Some(handle) = agents.get_mut(agent_id) else {
                return;
            };
            handle.info.state = state;
        }
        self.events.publish(OrchestratorEvent::AgentStateChanged {
            agent_id: agent_id.to_string(),
            state,
            detail,
        });
    }

    /// Release the claims of a request that will never start.
    async fn release_request(&self, request: &SpawnRequest) {
        for &feature_id in &request.feature_ids {
            if let Err(e) = self.claims.force_release(feature_id).await {
                warn!(feature_id, error = %e, "Failed to release claim of dropped spawn");
            }
        }
    }

    /// Bookkeeping after an agent process is gone.
    async fn finish(
        self: &Arc<Self>,
        session: &AgentSession,
        outcome: ExitOutcome,
        rate_limit: Option<RateLimitSignal>,
        permit: SlotPermit,
    ) {
        let agent_id = session.agent_id.as_str();
        self.agents.write().await.remove(agent_id);
        drop(permit);

        let released = match self.claims.release_agent(agent_id).await {
            Ok(released) => released,
            Err(e) => {
                error!(agent_id, error = %e, "Failed to release claims of exited agent");
                Vec::new()
            }
        };

        match outcome {
            ExitOutcome::Clean => {
                info!(agent_id, released = released.len(), "Agent exited cleanly");
                self.events.publish(OrchestratorEvent::AgentStateChanged {
                    agent_id: agent_id.to_string(),
                    state: AgentState::Success,
                    detail: None,
                });
                self.events.publish(OrchestratorEvent::AgentExited {
                    agent_id: agent_id.to_string(),
                    exit_code: Some(0),
                });
            }
            ExitOutcome::Terminated { exit_code } => {
                info!(agent_id, ?exit_code, "Agent terminated");
                self.events.publish(OrchestratorEvent::AgentExited {
                    agent_id: agent_id.to_string(),
                    exit_code,
                });
            }
            ExitOutcome::Crashed { exit_code, signal } => {
                warn!(
                    agent_id,
                    kind = ErrorKind::AgentCrashed.as_str(),
                    ?exit_code,
                    ?signal,
                    released = ?released,
                    rate_limited = rate_limit.is_some(),
                    "Agent crashed"
                );
                self.events.publish(OrchestratorEvent::AgentStateChanged {
                    agent_id: agent_id.to_string(),
                    state: AgentState::Error,
                    detail: exit_code.map(|c| format!("exit code {c}")),
                });
                self.events.publish(OrchestratorEvent::AgentCrashed {
                    agent_id: agent_id.to_string(),
                    exit_code,
                    signal,
                    released: released.clone(),
                });
            }
        }

        let _ = self.exit_tx.send(AgentExit {
            agent_id: agent_id.to_string(),
            kind: session.kind,
            initializer: session.initializer,
            outcome,
            rate_limit,
            released,
        });
        self.exited.notify_waiters();
        self.drain_queue().await;
    }

    /// Start queued requests in FIFO order while slots allow.
    async fn drain_queue(self: &Arc<Self>) {
        loop {
            if self.paused.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire) {
                return;
            }
            let (request, permit) = {
                let mut queue = self.queue.lock().await;
                let Some(front) = queue.front() else {
                    return;
                };
                let Ok(permit) = self.slots.try_reserve(front.kind) else {
                    return;
                };
                let Some(request) = queue.pop_front() else {
                    return;
                };
                (request, permit)
            };
            if let Err(e) = self.launch(request.clone(), permit).await {
                warn!(kind = request.kind.as_str(), error = %e, "Queued spawn failed");
                self.release_request(&request).await;
            }
        }
    }
}

/// Own the child until it exits, then clean up. Boxed so the future type
/// does not depend on itself through `launch`.
fn monitor(
    mut child: Child,
    session: AgentSession,
    permit: SlotPermit,
    mut kill_rx: oneshot::Receiver<()>,
    sandbox_file: PathBuf,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let inner = Arc::clone(&session.inner);
        let grace = inner.config.terminate_timeout;

        let stdout_task = child.stdout.take().map(|stdout| {
            let reader = AgentSession {
                inner: Arc::clone(&session.inner),
                agent_id: session.agent_id.clone(),
                kind: session.kind,
                initializer: session.initializer,
                sandbox: session.sandbox.clone(),
                stdin_tx: session.stdin_tx.clone(),
            };
            tokio::spawn(reader.read_stdout(stdout))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(session::read_stderr(session.agent_id.clone(), stderr)));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            Ok(()) = &mut kill_rx => None,
        };
        let (status, terminated) = match waited {
            Some(status) => (status, false),
            None => (process::terminate(&mut child, grace).await, true),
        };

        let mut rate_limit = None;
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            if let Ok(Ok(Some(signal))) = tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await {
                rate_limit = Some(signal);
            }
        }

        let outcome = ExitOutcome::classify(status, terminated);
        inner.finish(&session, outcome, rate_limit, permit).await;
        let _ = std::fs::remove_file(&sandbox_file);
    })
}
