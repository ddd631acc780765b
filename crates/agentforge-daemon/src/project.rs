//! Per-project state: data directory, single-daemon lease and the one-time
//! legacy layout migration.
//!
//! A [`ProjectContext`] is created once at startup, before storage is
//! opened, and owns the [`ProjectLease`] for as long as the daemon runs.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use agentforge_core::config::project_data_dir;
use agentforge_core::db::unix_timestamp;
use agentforge_core::model::{FeatureStatus, NewFeature};

use crate::storage::{Database, DatabaseError};

pub const DATABASE_FILE: &str = "agentforge.db";
pub const LEASE_FILE: &str = "agentforge.lock";

const LEGACY_DATA_DIR: &str = ".autoforge";
const LEGACY_DB_FILES: [&str; 3] = ["features.db", "features.db-wal", "features.db-shm"];
const LEGACY_FEATURE_LIST: &str = "feature_list.json";
const IMPORTED_SUFFIX: &str = ".imported";
const MAX_IMPORTED_NAME_CHARS: usize = 80;

const GITIGNORE_CONTENT: &str = "# agentforge runtime files\n*\n";

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Project {} is already served by pid {pid}", root.display())]
    Held { root: PathBuf, pid: u32 },

    #[error("Lease I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LeaseError + '_ {
    move |source| LeaseError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    pid: u32,
    acquired_at: i64,
}

/// Exclusive claim on a project directory, removed on drop.
#[derive(Debug)]
pub struct ProjectLease {
    path: PathBuf,
    pid: u32,
}

impl ProjectLease {
    /// Create the lease file. A file left by a dead process is reclaimed.
    pub fn acquire(path: &Path) -> Result<Self, LeaseError> {
        let pid = std::process::id();
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let record = LeaseRecord {
                        pid,
                        acquired_at: unix_timestamp(),
                    };
                    let json = serde_json::to_string(&record)
                        .map_err(|e| io_error(path)(io::Error::other(e)))?;
                    file.write_all(json.as_bytes()).map_err(io_error(path))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_holder(path) {
                        Some(holder) if pid_alive(holder) => {
                            return Err(LeaseError::Held {
                                root: path
                                    .parent()
                                    .and_then(Path::parent)
                                    .unwrap_or(path)
                                    .to_path_buf(),
                                pid: holder,
                            });
                        }
                        Some(holder) => {
                            warn!(pid = holder, path = %path.display(), "Reclaiming stale project lease");
                        }
                        None => {
                            warn!(path = %path.display(), "Reclaiming unreadable project lease");
                        }
                    }
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_error(path)(e)),
                    }
                }
                Err(e) => return Err(io_error(path)(e)),
            }
        }
        Err(io_error(path)(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lease file reappeared while reclaiming",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProjectLease {
    fn drop(&mut self) {
        if read_holder(&self.path) != Some(self.pid) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Released project lease"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove project lease"),
        }
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str::<LeaseRecord>(&content)
        .ok()
        .map(|r| r.pid)
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, 0) };
    ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub const fn pid_alive(_pid: u32) -> bool {
    true
}

/// Project root, data directory and the lease that makes them ours.
#[derive(Debug)]
pub struct ProjectContext {
    root: PathBuf,
    data_dir: PathBuf,
    lease: ProjectLease,
}

impl ProjectContext {
    /// Resolve the project, create `.agentforge/` and take the lease.
    pub fn open(root: &Path) -> Result<Self, LeaseError> {
        let root = std::fs::canonicalize(root).map_err(io_error(root))?;
        let data_dir = project_data_dir(&root);
        std::fs::create_dir_all(&data_dir).map_err(io_error(&data_dir))?;
        let lease = ProjectLease::acquire(&data_dir.join(LEASE_FILE)).map_err(|e| match e {
            LeaseError::Held { pid, .. } => LeaseError::Held {
                root: root.clone(),
                pid,
            },
            other => other,
        })?;
        info!(root = %root.display(), pid = lease.pid(), "Acquired project lease");
        Ok(Self {
            root,
            data_dir,
            lease,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    pub const fn lease(&self) -> &ProjectLease {
        &self.lease
    }
}

/// What [`migrate_legacy_layout`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub moved: Vec<String>,
    pub gitignore_written: bool,
}

/// Move files from older layouts into `.agentforge/`.
///
/// Idempotent: items whose target already exists are left alone, and a
/// failed item is logged without stopping the rest. Requires the lease,
/// which the `&ProjectContext` argument proves.
pub fn migrate_legacy_layout(ctx: &ProjectContext) -> MigrationReport {
    let mut report = MigrationReport::default();

    let legacy_dir = ctx.root.join(LEGACY_DATA_DIR);
    if legacy_dir.is_dir() {
        match std::fs::read_dir(&legacy_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let label = format!(
                        "{LEGACY_DATA_DIR}/{} -> {}",
                        name.to_string_lossy(),
                        name.to_string_lossy()
                    );
                    move_item(&entry.path(), &ctx.data_dir.join(&name), label, &mut report);
                }
            }
            Err(e) => warn!(path = %legacy_dir.display(), error = %e, "Cannot read legacy data directory"),
        }
        if std::fs::remove_dir(&legacy_dir).is_ok() {
            info!(path = %legacy_dir.display(), "Removed empty legacy data directory");
        }
    }

    for name in LEGACY_DB_FILES {
        move_item(
            &ctx.root.join(name),
            &ctx.data_dir.join(name),
            name.to_string(),
            &mut report,
        );
    }

    let gitignore = ctx.data_dir.join(".gitignore");
    if !gitignore.exists() {
        match std::fs::write(&gitignore, GITIGNORE_CONTENT) {
            Ok(()) => report.gitignore_written = true,
            Err(e) => warn!(path = %gitignore.display(), error = %e, "Failed to write .gitignore"),
        }
    }

    if !report.moved.is_empty() {
        info!(count = report.moved.len(), items = ?report.moved, "Migrated legacy project layout");
    }
    report
}

fn move_item(from: &Path, to: &Path, label: String, report: &mut MigrationReport) {
    if !from.exists() {
        return;
    }
    if to.exists() {
        debug!(from = %from.display(), "Legacy item already migrated, leaving it");
        return;
    }
    match std::fs::rename(from, to) {
        Ok(()) => report.moved.push(label),
        Err(e) => warn!(from = %from.display(), to = %to.display(), error = %e, "Failed to migrate legacy item"),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Deserialize)]
struct LegacyFeature {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    steps: Vec<String>,
    #[serde(default)]
    passes: bool,
}

impl LegacyFeature {
    fn into_new_feature(self, position: usize) -> (NewFeature, bool) {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                self.description
                    .lines()
                    .next()
                    .map(|line| line.trim().chars().take(MAX_IMPORTED_NAME_CHARS).collect())
                    .filter(|line: &String| !line.is_empty())
            })
            .unwrap_or_else(|| format!("Feature {}", position + 1));
        let feature = NewFeature {
            name,
            description: self.description,
            category: self.category,
            steps: self.steps,
            ..NewFeature::default()
        };
        (feature, self.passes)
    }
}

/// Import a legacy `feature_list.json` into an empty store, then rename it
/// so the import never repeats. Returns the number of imported features.
pub async fn import_legacy_feature_list(
    ctx: &ProjectContext,
    db: &Database,
) -> Result<Option<usize>, ImportError> {
    let path = ctx.root.join(LEGACY_FEATURE_LIST);
    if !path.is_file() {
        return Ok(None);
    }
    if db.count_features().await? > 0 {
        info!(path = %path.display(), "Feature store not empty, skipping legacy feature list");
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path).map_err(|source| ImportError::Io {
        path: path.clone(),
        source,
    })?;
    let legacy: Vec<LegacyFeature> =
        serde_json::from_str(&content).map_err(|source| ImportError::Json {
            path: path.clone(),
            source,
        })?;

    let (batch, passes): (Vec<(NewFeature, Vec<usize>)>, Vec<bool>) = legacy
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            let (feature, passes) = f.into_new_feature(i);
            ((feature, Vec::new()), passes)
        })
        .unzip();

    let created = db.create_features(&batch).await?;
    let now = unix_timestamp();
    for (mut feature, passed) in created.iter().cloned().zip(passes) {
        if passed {
            feature.status = FeatureStatus::Passing;
            feature.last_tested_at = Some(now);
            db.save_feature_state(&feature).await?;
        }
    }

    let mut imported = path.clone().into_os_string();
    imported.push(IMPORTED_SUFFIX);
    std::fs::rename(&path, &imported).map_err(|source| ImportError::Io {
        path: path.clone(),
        source,
    })?;
    info!(count = created.len(), path = %path.display(), "Imported legacy feature list");
    Ok(Some(created.len()))
}
