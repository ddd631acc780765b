//! Policy evaluation.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::document::{CompiledEntries, OrgPolicyDocument, PolicyIssue, ProjectPolicyDocument};
use super::parse::{leading_executable, split_segments};
use super::pattern::{CommandPattern, Executable};
use super::{Decision, PolicyDenied, PolicyEntry, PolicyTier};

/// Destructive or system-altering commands. Not configurable.
const HARDCODED_BLOCKLIST: &[&str] = &[
    "sudo", "su", "doas", "pkexec", "dd", "mkfs*", "fdisk", "sfdisk", "parted", "diskutil",
    "shutdown", "reboot", "halt", "poweroff", "init", "systemctl", "launchctl", "crontab",
    "chown", "chroot", "passwd", "useradd", "userdel", "usermod", "iptables", "mount", "umount",
    "insmod", "rmmod", "modprobe", "nc", "ncat", "eval", "exec",
];

/// Baseline developer tools allowed everywhere.
const GLOBAL_ALLOWLIST: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "find", "echo", "pwd", "cp", "mv", "mkdir",
    "touch", "chmod", "sort", "diff", "sed", "awk", "which", "test", "true", "false", "sleep",
    "ps", "lsof", "git", "npm", "npx", "node", "pnpm", "yarn", "python", "python3", "pip",
    "pytest", "cargo", "rustc", "go", "make", "tsc", "curl",
];

/// Compiled, immutable policy.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    /// Sorted by tier; order within a tier is document order.
    entries: Vec<PolicyEntry>,
    project_root: Option<PathBuf>,
    issues: Vec<PolicyIssue>,
}

impl PolicyEngine {
    /// Engine with only the hardcoded and global tiers.
    pub fn new(project_root: Option<PathBuf>) -> Self {
        let mut entries: Vec<PolicyEntry> = HARDCODED_BLOCKLIST
            .iter()
            .map(|raw| {
                PolicyEntry::new(
                    PolicyTier::HardcodedBlock,
                    CommandPattern::literal(raw),
                    "hardcoded blocklist",
                )
            })
            .collect();
        entries.extend(GLOBAL_ALLOWLIST.iter().map(|raw| {
            PolicyEntry::new(
                PolicyTier::GlobalAllow,
                CommandPattern::literal(raw),
                "global default allowlist",
            )
        }));

        Self {
            entries,
            project_root,
            issues: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_org_document(mut self, doc: &OrgPolicyDocument, source: &str) -> Self {
        let compiled = doc.compile(source, self.project_root.as_deref());
        self.absorb(compiled);
        self
    }

    #[must_use]
    pub fn with_project_document(mut self, doc: &ProjectPolicyDocument, source: &str) -> Self {
        let compiled = doc.compile(source, self.project_root.as_deref());
        self.absorb(compiled);
        self
    }

    /// Load the org and project documents from disk.
    ///
    /// Missing documents are fine. Unreadable or unparseable documents are
    /// recorded as issues and contribute no entries.
    pub fn load(project_root: &Path, org_policy_path: Option<&Path>) -> Self {
        let mut engine = Self::new(Some(project_root.to_path_buf()));

        if let Some(path) = org_policy_path {
            let source = path.display().to_string();
            match OrgPolicyDocument::load(path) {
                Ok(Some(doc)) => engine = engine.with_org_document(&doc, &source),
                Ok(None) => debug!(path = %source, "No organization policy document"),
                Err(e) => engine.document_failed(&source, &e.to_string()),
            }
        }

        let project_path = super::project_policy_path(project_root);
        let source = project_path.display().to_string();
        match ProjectPolicyDocument::load(&project_path) {
            Ok(Some(doc)) => engine = engine.with_project_document(&doc, &source),
            Ok(None) => debug!(path = %source, "No project policy document"),
            Err(e) => engine.document_failed(&source, &e.to_string()),
        }

        info!(
            entries = engine.entries.len(),
            issues = engine.issues.len(),
            "Command policy loaded"
        );
        engine
    }

    fn document_failed(&mut self, source: &str, reason: &str) {
        warn!(source, error = reason, "Ignoring unreadable policy document");
        self.issues.push(PolicyIssue {
            source: source.to_string(),
            entry: String::new(),
            reason: reason.to_string(),
        });
    }

    fn absorb(&mut self, compiled: CompiledEntries) {
        self.entries.extend(compiled.entries);
        self.entries.sort_by_key(|e| e.tier);
        self.issues.extend(compiled.issues);
    }

    pub fn entries(&self) -> &[PolicyEntry] {
        &self.entries
    }

    /// Entries rejected at load time.
    pub fn issues(&self) -> &[PolicyIssue] {
        &self.issues
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Evaluate a full command line. Every segment must be allowed.
    pub fn evaluate(&self, command_line: &str) -> Decision {
        let decision = self.evaluate_inner(command_line);
        match &decision {
            Decision::Allow { tier, pattern } => {
                debug!(command = command_line, tier = %tier, pattern, "Command allowed");
            }
            Decision::Deny {
                reason,
                tier,
                pattern,
            } => {
                warn!(
                    command = command_line,
                    tier = tier.map_or("none", PolicyTier::as_str),
                    pattern = pattern.as_deref().unwrap_or("<unmatched>"),
                    reason,
                    "Command denied by policy"
                );
            }
        }
        decision
    }

    /// [`evaluate`](Self::evaluate) as a `Result`.
    pub fn check(&self, command_line: &str) -> Result<PolicyTier, PolicyDenied> {
        self.evaluate(command_line).into_result(command_line)
    }

    fn evaluate_inner(&self, command_line: &str) -> Decision {
        let segments = match split_segments(command_line) {
            Ok(segments) => segments,
            Err(e) => {
                return Decision::Deny {
                    reason: format!("unparseable command: {e}"),
                    tier: None,
                    pattern: None,
                };
            }
        };

        // An allowed line reports the match of its last segment.
        let mut last_allow = None;
        for segment in &segments {
            let Some(token) = leading_executable(segment) else {
                return Decision::Deny {
                    reason: "segment has no executable".to_string(),
                    tier: None,
                    pattern: None,
                };
            };
            let exe = Executable::resolve(token, self.project_root.as_deref());
            match self.evaluate_executable(&exe) {
                allow @ Decision::Allow { .. } => last_allow = Some(allow),
                deny @ Decision::Deny { .. } => return deny,
            }
        }
        last_allow.unwrap_or_else(|| Decision::Deny {
            reason: "empty command".to_string(),
            tier: None,
            pattern: None,
        })
    }

    fn evaluate_executable(&self, exe: &Executable) -> Decision {
        if exe.escapes_root {
            return Decision::Deny {
                reason: format!("{} resolves outside the project root", exe.token),
                tier: None,
                pattern: None,
            };
        }

        let Some(entry) = self.entries.iter().find(|e| e.matches(exe)) else {
            return Decision::Deny {
                reason: format!("{} is not on any allowlist", exe.token),
                tier: None,
                pattern: None,
            };
        };

        if entry.tier.is_block() {
            Decision::Deny {
                reason: format!("{} is blocked ({})", exe.token, entry.description),
                tier: Some(entry.tier),
                pattern: Some(entry.pattern.to_string()),
            }
        } else {
            Decision::Allow {
                tier: entry.tier,
                pattern: entry.pattern.to_string(),
            }
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(None)
    }
}
