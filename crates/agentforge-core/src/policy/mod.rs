//! Layered command-execution policy.
//!
//! Every shell command an agent wants to run is evaluated against five
//! ordered tiers, highest priority first, first match wins:
//!
//! 1. hardcoded blocklist (compiled in, never overridable)
//! 2. organization blocklist
//! 3. organization allowlist
//! 4. global default allowlist
//! 5. project allowlist
//!
//! Anything that matches no tier is denied.

mod document;
mod engine;
mod parse;
mod pattern;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use document::{
    AllowedCommand, CompiledEntries, MAX_PROJECT_ENTRIES, OrgPolicyDocument, PolicyIssue,
    ProjectPolicyDocument, project_policy_path,
};
pub use engine::PolicyEngine;
pub use parse::{ParseError, leading_executable, split_segments};
pub use pattern::{CommandPattern, Executable, PatternError};

use crate::error::ErrorKind;

/// Policy tier, declared in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    HardcodedBlock,
    OrgBlock,
    OrgAllow,
    GlobalAllow,
    ProjectAllow,
}

impl PolicyTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HardcodedBlock => "hardcoded-block",
            Self::OrgBlock => "org-block",
            Self::OrgAllow => "org-allow",
            Self::GlobalAllow => "global-allow",
            Self::ProjectAllow => "project-allow",
        }
    }

    /// Matching an entry of this tier denies the command.
    pub const fn is_block(self) -> bool {
        matches!(self, Self::HardcodedBlock | Self::OrgBlock)
    }
}

impl fmt::Display for PolicyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One compiled policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub tier: PolicyTier,
    pub pattern: CommandPattern,
    pub description: String,
}

impl PolicyEntry {
    pub fn new(tier: PolicyTier, pattern: CommandPattern, description: impl Into<String>) -> Self {
        Self {
            tier,
            pattern,
            description: description.into(),
        }
    }

    /// Block tiers compare basenames so `/usr/bin/sudo` cannot dodge `sudo`.
    pub fn matches(&self, exe: &Executable) -> bool {
        self.pattern.matches(exe, self.tier.is_block())
    }
}

/// Result of evaluating a command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow {
        tier: PolicyTier,
        pattern: String,
    },
    Deny {
        reason: String,
        /// `None` when nothing matched (fail-closed default) or parsing failed.
        tier: Option<PolicyTier>,
        pattern: Option<String>,
    },
}

impl Decision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn into_result(self, command: &str) -> Result<PolicyTier, PolicyDenied> {
        match self {
            Self::Allow { tier, .. } => Ok(tier),
            Self::Deny {
                reason,
                tier,
                pattern,
            } => Err(PolicyDenied {
                command: command.to_string(),
                reason,
                tier,
                pattern,
            }),
        }
    }
}

/// A command refused by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command denied: {reason}")]
pub struct PolicyDenied {
    pub command: String,
    pub reason: String,
    pub tier: Option<PolicyTier>,
    pub pattern: Option<String>,
}

impl PolicyDenied {
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::PolicyDenied
    }
}
