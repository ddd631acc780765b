//! Human-edited policy documents (TOML).
//!
//! Organization document:
//!
//! ```toml
//! blocked_commands = ["terraform", "kubectl"]
//!
//! [[allowed_commands]]
//! name = "swift*"
//! description = "Swift toolchain"
//! ```
//!
//! Project document (`.agentforge/policy.toml`) only has `allowed_commands`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::pattern::CommandPattern;
use super::{PolicyEntry, PolicyTier};
use crate::config::project_data_dir;
use crate::error::{Error, Result};

/// Maximum entries honoured in a project allowlist.
pub const MAX_PROJECT_ENTRIES: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgPolicyDocument {
    pub blocked_commands: Vec<String>,
    pub allowed_commands: Vec<AllowedCommand>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectPolicyDocument {
    pub allowed_commands: Vec<AllowedCommand>,
}

/// A policy entry that was skipped at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyIssue {
    /// Document the entry came from.
    pub source: String,
    pub entry: String,
    pub reason: String,
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}: {}", self.source, self.entry, self.reason)
    }
}

/// Entries compiled from one document plus the entries it rejected.
#[derive(Debug, Clone, Default)]
pub struct CompiledEntries {
    pub entries: Vec<PolicyEntry>,
    pub issues: Vec<PolicyIssue>,
}

impl CompiledEntries {
    fn add(
        &mut self,
        source: &str,
        tier: PolicyTier,
        raw: &str,
        description: &str,
        project_root: Option<&Path>,
    ) {
        match CommandPattern::parse(raw, project_root) {
            Ok(pattern) => self
                .entries
                .push(PolicyEntry::new(tier, pattern, description)),
            Err(e) => {
                warn!(source, entry = raw, tier = %tier, error = %e, "Skipping malformed policy entry");
                self.issues.push(PolicyIssue {
                    source: source.to_string(),
                    entry: raw.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Project policy document path.
pub fn project_policy_path(project_root: &Path) -> PathBuf {
    project_data_dir(project_root).join("policy.toml")
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Policy(format!(
            "Failed to read policy file {}: {e}",
            path.display()
        ))),
    }
}

impl OrgPolicyDocument {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Policy(e.to_string()))
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_optional(path)?
            .map(|content| {
                Self::from_toml(&content)
                    .map_err(|e| Error::Policy(format!("{}: {e}", path.display())))
            })
            .transpose()
    }

    pub fn compile(&self, source: &str, project_root: Option<&Path>) -> CompiledEntries {
        let mut out = CompiledEntries::default();
        for raw in &self.blocked_commands {
            out.add(
                source,
                PolicyTier::OrgBlock,
                raw,
                "organization blocklist",
                project_root,
            );
        }
        for cmd in &self.allowed_commands {
            out.add(
                source,
                PolicyTier::OrgAllow,
                &cmd.name,
                &cmd.description,
                project_root,
            );
        }
        out
    }
}

impl ProjectPolicyDocument {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Policy(e.to_string()))
    }

    /// `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        read_optional(path)?
            .map(|content| {
                Self::from_toml(&content)
                    .map_err(|e| Error::Policy(format!("{}: {e}", path.display())))
            })
            .transpose()
    }

    /// Compile the allowlist; entries past [`MAX_PROJECT_ENTRIES`] are rejected.
    pub fn compile(&self, source: &str, project_root: Option<&Path>) -> CompiledEntries {
        let mut out = CompiledEntries::default();
        for (i, cmd) in self.allowed_commands.iter().enumerate() {
            if i >= MAX_PROJECT_ENTRIES {
                warn!(source, entry = %cmd.name, "Project allowlist is over its entry cap");
                out.issues.push(PolicyIssue {
                    source: source.to_string(),
                    entry: cmd.name.clone(),
                    reason: format!("project allowlist is capped at {MAX_PROJECT_ENTRIES} entries"),
                });
                continue;
            }
            out.add(
                source,
                PolicyTier::ProjectAllow,
                &cmd.name,
                &cmd.description,
                project_root,
            );
        }
        out
    }
}
