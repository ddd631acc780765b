//! Configuration resolution for agentforge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/agentforge/settings.json`)
//! 3. Project config (`.agentforge/settings.json`)
//! 4. Environment variables (`AGENTFORGE_*`)
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the per-project data directory.
pub const PROJECT_DIR_NAME: &str = ".agentforge";

/// Hard ceiling on concurrently running coding agents.
pub const MAX_CODING_AGENTS: usize = 5;

/// Hard ceiling on coding + testing agents combined.
pub const MAX_TOTAL_AGENTS: usize = 10;

/// Complete agentforge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Daemon process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// HTTP control surface bind address.
    pub addr: String,
    pub log_level: String,
    /// Overrides `<project>/.agentforge/agentforge.db`.
    pub database_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8765".to_string(),
            log_level: "info".to_string(),
            database_path: None,
        }
    }
}

/// Control loop and concurrency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Requested coding agents, clamped to `1..=MAX_CODING_AGENTS`.
    pub max_coding_agents: usize,
    /// Testing agents per running coding agent (0 disables regression testing).
    pub testing_agents_per_coding: usize,
    /// Features handed to one coding agent per claim.
    pub features_per_agent: usize,
    /// Idle poll interval when no work is ready.
    pub idle_interval_ms: u64,
    /// Failing releases before a feature is parked as `failing`.
    pub max_feature_failures: u32,
    /// Grace period between SIGTERM and SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_coding_agents: MAX_CODING_AGENTS,
            testing_agents_per_coding: 1,
            features_per_agent: 1,
            idle_interval_ms: 5_000,
            max_feature_failures: 3,
            terminate_timeout_secs: 10,
        }
    }
}

impl OrchestratorConfig {
    /// Effective coding-agent ceiling.
    pub fn coding_limit(&self) -> usize {
        self.max_coding_agents.clamp(1, MAX_CODING_AGENTS)
    }
}

/// How agent subprocesses are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub program: PathBuf,
    /// Arguments passed before any per-run arguments.
    pub args: Vec<String>,
    /// Model used when a run does not override it.
    pub default_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("agentforge-agent"),
            args: Vec::new(),
            default_model: "claude-sonnet-4-20250514".to_string(),
        }
    }
}

/// Crash-restart policy for scheduled runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First restart delay; doubled on every further attempt.
    pub base_delay_ms: u64,
    /// Restarts allowed within one scheduled occurrence.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 15_000,
            max_attempts: 3,
        }
    }
}

/// Scheduler tick settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
        }
    }
}

/// Extra read-only paths granted to every agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SandboxSettings {
    pub extra_read_paths: Vec<PathBuf>,
}

/// Policy document locations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    /// Organization policy; defaults to `<global dir>/org-policy.toml`.
    pub org_policy_path: Option<PathBuf>,
}

impl PolicyConfig {
    /// Resolved organization policy path, if any.
    pub fn org_policy_path(&self) -> Option<PathBuf> {
        self.org_policy_path
            .clone()
            .or_else(|| global_config_dir().map(|d| d.join("org-policy.toml")))
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Global agentforge config directory (`~/.config/agentforge` on Linux).
pub fn global_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("agentforge"))
}

/// Global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|p| p.join("settings.json"))
}

/// Per-project data directory.
pub fn project_data_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(PROJECT_DIR_NAME)
}

/// Per-project settings file path.
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_data_dir(project_dir).join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    if overlay.daemon.database_path.is_some() {
        base.daemon.database_path = overlay.daemon.database_path;
    }
    base.daemon.addr = overlay.daemon.addr;
    base.daemon.log_level = overlay.daemon.log_level;

    base.orchestrator = overlay.orchestrator;
    base.agent = overlay.agent;
    base.retry = overlay.retry;
    base.scheduler = overlay.scheduler;

    // Read paths accumulate across layers.
    for path in overlay.sandbox.extra_read_paths {
        if !base.sandbox.extra_read_paths.contains(&path) {
            base.sandbox.extra_read_paths.push(path);
        }
    }

    if overlay.policy.org_policy_path.is_some() {
        base.policy.org_policy_path = overlay.policy.org_policy_path;
    }
}

fn apply_env_overrides(config: &mut Config) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("AGENTFORGE_ADDR") {
        config.daemon.addr = val;
    }
    if let Some(val) = lookup("AGENTFORGE_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("AGENTFORGE_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("AGENTFORGE_MAX_CODING_AGENTS").and_then(|v| v.parse().ok()) {
        config.orchestrator.max_coding_agents = n;
    }
    if let Some(n) = lookup("AGENTFORGE_IDLE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.orchestrator.idle_interval_ms = n;
    }
    if let Some(val) = lookup("AGENTFORGE_AGENT_PROGRAM") {
        config.agent.program = PathBuf::from(val);
    }
    if let Some(val) = lookup("AGENTFORGE_DEFAULT_MODEL") {
        config.agent.default_model = val;
    }
    if let Some(n) = lookup("AGENTFORGE_TICK_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.scheduler.tick_interval_secs = n;
    }
    if let Some(val) = lookup("AGENTFORGE_ORG_POLICY") {
        config.policy.org_policy_path = Some(PathBuf::from(val));
    }
}
