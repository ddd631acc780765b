//! Command patterns and resolved executables.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

const FORBIDDEN_CHARS: &[char] = &[
    ';', '&', '|', '<', '>', '$', '`', '\'', '"', '(', ')', '{', '}', '\\', '?', '[', ']',
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,

    #[error("pattern contains whitespace")]
    Whitespace,

    #[error("pattern contains forbidden character {0:?}")]
    ForbiddenChar(char),

    #[error("a bare `*` would allow every command")]
    BareWildcard,

    #[error("`*` is only allowed as the last character")]
    MisplacedWildcard,

    #[error("script paths must begin with ./")]
    ScriptPrefix,

    #[error("script path escapes the project root")]
    EscapesRoot,
}

/// How a policy entry matches an executable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandPattern {
    /// Exact executable name.
    Exact(String),
    /// `prefix*`: any executable starting with the prefix, including the prefix itself.
    WildcardPrefix(String),
    /// `./path/to/script`, stored normalized relative to the project root.
    RelativeScript(PathBuf),
}

impl CommandPattern {
    /// Parse a pattern as written in a policy document.
    pub fn parse(raw: &str, project_root: Option<&Path>) -> Result<Self, PatternError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(PatternError::Whitespace);
        }
        if let Some(c) = raw.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
            return Err(PatternError::ForbiddenChar(c));
        }

        if raw.contains('/') {
            if !raw.starts_with("./") {
                return Err(PatternError::ScriptPrefix);
            }
            if raw.contains('*') {
                return Err(PatternError::MisplacedWildcard);
            }
            let rel = normalize_within(Path::new(raw)).ok_or(PatternError::EscapesRoot)?;
            if let Some(root) = project_root
                && !stays_within(root, &rel)
            {
                return Err(PatternError::EscapesRoot);
            }
            return Ok(Self::RelativeScript(rel));
        }

        match raw.find('*') {
            None => Ok(Self::Exact(raw.to_string())),
            Some(0) if raw.len() == 1 => Err(PatternError::BareWildcard),
            Some(i) if i == raw.len() - 1 => Ok(Self::WildcardPrefix(raw[..i].to_string())),
            Some(_) => Err(PatternError::MisplacedWildcard),
        }
    }

    /// Build a name pattern from a trusted literal (`"mkfs*"`, `"sudo"`).
    pub(crate) fn literal(raw: &str) -> Self {
        raw.strip_suffix('*').map_or_else(
            || Self::Exact(raw.to_string()),
            |prefix| Self::WildcardPrefix(prefix.to_string()),
        )
    }

    /// Match against an executable.
    ///
    /// With `by_basename` the name patterns compare the token's basename;
    /// otherwise they only match bare names (tokens without a `/`).
    pub fn matches(&self, exe: &Executable, by_basename: bool) -> bool {
        let name = if by_basename {
            Some(exe.basename.as_str())
        } else if exe.is_bare() {
            Some(exe.token.as_str())
        } else {
            None
        };
        match self {
            Self::Exact(n) => name == Some(n.as_str()),
            Self::WildcardPrefix(prefix) => name.is_some_and(|n| n.starts_with(prefix.as_str())),
            Self::RelativeScript(path) => exe.script.as_deref() == Some(path.as_path()),
        }
    }
}

impl fmt::Display for CommandPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => f.write_str(n),
            Self::WildcardPrefix(p) => write!(f, "{p}*"),
            Self::RelativeScript(p) => write!(f, "./{}", p.display()),
        }
    }
}

/// The leading token of a command segment, resolved for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub token: String,
    pub basename: String,
    /// Normalized project-relative path when the token is a relative path
    /// that stays inside the project root.
    pub script: Option<PathBuf>,
    /// The token is a relative path that resolves outside the root.
    pub escapes_root: bool,
}

impl Executable {
    pub fn resolve(token: &str, project_root: Option<&Path>) -> Self {
        let path = Path::new(token);
        let basename = path
            .file_name()
            .map_or_else(|| token.to_string(), |n| n.to_string_lossy().into_owned());

        let mut script = None;
        let mut escapes_root = false;
        if token.contains('/') && !path.is_absolute() {
            match normalize_within(path) {
                Some(rel) if project_root.is_none_or(|root| stays_within(root, &rel)) => {
                    script = Some(rel);
                }
                _ => escapes_root = true,
            }
        }

        Self {
            token: token.to_string(),
            basename,
            script,
            escapes_root,
        }
    }

    pub fn is_bare(&self) -> bool {
        !self.token.contains('/')
    }
}

/// Lexically normalize a relative path; `None` if it climbs above its start.
fn normalize_within(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Symlink-aware check for paths that exist on disk.
fn stays_within(root: &Path, rel: &Path) -> bool {
    match (root.canonicalize(), root.join(rel).canonicalize()) {
        (Ok(root), Ok(full)) => full.starts_with(root),
        _ => true,
    }
}
