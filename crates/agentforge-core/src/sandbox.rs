//! Filesystem boundary for agent processes.
//!
//! An agent may write only under its project root and read the root plus
//! explicitly configured extra paths. Sensitive directories (credential and
//! key stores, kernel/system trees) are always denied, even when configured
//! as extra read paths.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ErrorKind;

/// Home-relative credential and key stores.
const SENSITIVE_HOME_DIRS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".kube",
    ".docker",
    ".config/gcloud",
    ".password-store",
    ".netrc",
];

const SENSITIVE_SYSTEM_DIRS: &[&str] = &["/etc", "/proc", "/sys", "/dev", "/boot"];

/// Requested sandbox for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub extra_read_paths: Vec<PathBuf>,
}

impl SandboxConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extra_read_paths: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_read_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.extra_read_paths.extend(paths);
        self
    }
}

/// Access outside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sandbox violation at {}: {reason}", path.display())]
pub struct SandboxViolation {
    pub path: PathBuf,
    pub reason: String,
}

impl SandboxViolation {
    fn new(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::SandboxViolation
    }
}

/// Settings handed to the agent process as a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettingsFile {
    pub root: PathBuf,
    pub read_only_paths: Vec<PathBuf>,
    pub denied_paths: Vec<PathBuf>,
}

/// Validated, resolved sandbox.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    root: PathBuf,
    read_paths: Vec<PathBuf>,
    denied: Vec<PathBuf>,
    rejected: Vec<SandboxViolation>,
}

/// Default sensitive directories for the current user.
pub fn sensitive_directories() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = SENSITIVE_SYSTEM_DIRS.iter().map(PathBuf::from).collect();
    if let Some(home) = dirs::home_dir() {
        dirs.extend(SENSITIVE_HOME_DIRS.iter().map(|d| home.join(d)));
    }
    dirs
}

impl SandboxPolicy {
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxViolation> {
        Self::with_denylist(config, sensitive_directories())
    }

    /// Build with an explicit denylist.
    pub fn with_denylist(
        config: &SandboxConfig,
        denylist: Vec<PathBuf>,
    ) -> Result<Self, SandboxViolation> {
        let root = resolve(&config.root)
            .ok_or_else(|| SandboxViolation::new(&config.root, "sandbox root must be absolute"))?;
        if root.parent().is_none() {
            return Err(SandboxViolation::new(&root, "filesystem root cannot be a sandbox"));
        }
        let denied: Vec<PathBuf> = denylist.iter().filter_map(|d| resolve(d)).collect();
        if let Some(d) = denied.iter().find(|d| root.starts_with(d)) {
            return Err(SandboxViolation::new(
                &root,
                format!("sandbox root lies inside sensitive directory {}", d.display()),
            ));
        }

        let mut read_paths = Vec::new();
        let mut rejected = Vec::new();
        for extra in &config.extra_read_paths {
            let Some(path) = resolve(extra) else {
                rejected.push(SandboxViolation::new(extra, "extra paths must be absolute"));
                continue;
            };
            if let Some(d) = denied
                .iter()
                .find(|d| path.starts_with(d) || d.starts_with(&path))
            {
                warn!(
                    path = %path.display(),
                    sensitive = %d.display(),
                    "Dropping extra read path that exposes a sensitive directory"
                );
                rejected.push(SandboxViolation::new(
                    &path,
                    format!("exposes sensitive directory {}", d.display()),
                ));
                continue;
            }
            read_paths.push(path);
        }

        Ok(Self {
            root,
            read_paths,
            denied,
            rejected,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read_paths(&self) -> &[PathBuf] {
        &self.read_paths
    }

    /// Extra paths dropped during validation.
    pub fn rejected(&self) -> &[SandboxViolation] {
        &self.rejected
    }

    /// Check one access. Relative paths are taken relative to the root.
    pub fn check_access(&self, path: &Path, write: bool) -> Result<(), SandboxViolation> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved =
            resolve(&joined).ok_or_else(|| SandboxViolation::new(path, "unresolvable path"))?;

        if let Some(d) = self.denied.iter().find(|d| resolved.starts_with(d)) {
            return Err(SandboxViolation::new(
                &resolved,
                format!("inside sensitive directory {}", d.display()),
            ));
        }
        if resolved.starts_with(&self.root) {
            return Ok(());
        }
        if write {
            return Err(SandboxViolation::new(&resolved, "writes are limited to the project root"));
        }
        if self.read_paths.iter().any(|p| resolved.starts_with(p)) {
            return Ok(());
        }
        Err(SandboxViolation::new(&resolved, "outside the sandbox"))
    }

    pub fn settings(&self) -> SandboxSettingsFile {
        SandboxSettingsFile {
            root: self.root.clone(),
            read_only_paths: self.read_paths.clone(),
            denied_paths: self.denied.clone(),
        }
    }

    /// Write [`settings`](Self::settings) as pretty JSON.
    pub fn write_settings_file(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings()).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// Absolute, lexically normalized path with the longest existing ancestor
/// canonicalized so symlinks cannot smuggle a path out of a prefix check.
fn resolve(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Some(out);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Some(normalized),
        }
    }
}
