//! The snapshot engine: capture the known state keys into a snapshot file,
//! and apply a snapshot back into every state database file with
//! safety-copy rollback.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use aether_switch_core::snapshot::{self, Snapshot, SnapshotError, KNOWN_STATE_KEYS};

use crate::db::{DbError, DbOptions, StateDb};

const SAFETY_SUFFIX: &str = ".safety_backup";
const TEMP_SUFFIX: &str = ".tmp";
const OLD_SUFFIX: &str = ".old";

/// The state database files belonging to one installation of the managed
/// application: a primary file plus an optional secondary/backup file the
/// application maintains alongside it.
#[derive(Debug, Clone)]
pub struct DatabaseLayout {
    pub primary: PathBuf,
    pub secondary: Option<PathBuf>,
}

impl DatabaseLayout {
    #[must_use]
    pub fn new(primary: PathBuf) -> Self {
        Self { primary, secondary: None }
    }

    #[must_use]
    pub fn with_secondary(primary: PathBuf, secondary: PathBuf) -> Self {
        Self { primary, secondary: Some(secondary) }
    }

    /// Layout with the conventional `<primary>.backup` secondary file.
    #[must_use]
    pub fn with_default_secondary(primary: PathBuf) -> Self {
        let secondary = sibling(&primary, ".backup");
        Self { primary, secondary: Some(secondary) }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no state database found to capture")]
    NoDatabaseFound,
    #[error("could not connect to the state database: {0}")]
    ConnectionFailed(#[from] DbError),
    #[error("captured snapshot failed validation: {0}")]
    ValidationFailed(#[from] SnapshotError),
    #[error("failed to write snapshot {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("snapshot file not found: {path}")]
    SourceMissing { path: PathBuf },
    #[error("snapshot rejected: {0}")]
    ValidationFailed(#[from] SnapshotError),
    #[error("no state database found to restore into")]
    NoDatabaseFound,
    #[error("restore of {path} failed: {source}; previous state rolled back")]
    RestoreFailed {
        path: PathBuf,
        #[source]
        source: DbError,
    },
}

/// Capture the known state keys from the first existing primary database
/// into a validated snapshot file at `destination`.
///
/// Key reads are best-effort: a missing or unreadable key is skipped with a
/// log line, never fatal. The snapshot is written to a temp path and
/// re-validated before it replaces any prior snapshot; a prior snapshot is
/// kept under a `.old` suffix until the new one has durably landed, so a
/// crash mid-write never leaves zero valid snapshots where one existed.
///
/// # Errors
/// Returns [`CaptureError::NoDatabaseFound`] when no primary database file
/// exists, [`CaptureError::ConnectionFailed`] when the database cannot be
/// opened, [`CaptureError::ValidationFailed`] when the captured data does
/// not form a valid snapshot, or [`CaptureError::WriteFailed`] on file I/O.
pub fn capture(
    email: &str,
    layouts: &[DatabaseLayout],
    destination: &Path,
    options: &DbOptions,
) -> Result<(), CaptureError> {
    let Some(db_path) = layouts.iter().map(|layout| &layout.primary).find(|path| path.exists())
    else {
        return Err(CaptureError::NoDatabaseFound);
    };

    tracing::info!(path = %db_path.display(), "capturing state snapshot");
    let db = StateDb::open(db_path, options)?;

    let mut entries = BTreeMap::new();
    for key in KNOWN_STATE_KEYS {
        match db.read_state(key) {
            Ok(Some(value)) => {
                tracing::debug!(key, "captured state key");
                entries.insert(key.to_string(), value);
            }
            Ok(None) => tracing::debug!(key, "state key absent, skipping"),
            Err(err) => tracing::warn!(key, error = %err, "failed to read state key, skipping"),
        }
    }

    let bytes = Snapshot::new(email, entries)?.encode()?;
    let temp = sibling(destination, TEMP_SUFFIX);
    fs::write(&temp, &bytes)
        .map_err(|source| CaptureError::WriteFailed { path: temp.clone(), source })?;

    // Self-check the file we actually wrote before letting it replace
    // anything.
    if let Err(err) = snapshot::validate_file(&temp) {
        discard_temp(&temp);
        return Err(err.into());
    }

    let old = sibling(destination, OLD_SUFFIX);
    if destination.exists() {
        if old.exists() {
            if let Err(err) = fs::remove_file(&old) {
                tracing::warn!(path = %old.display(), error = %err, "failed to clear stale old snapshot");
            }
        }
        if let Err(source) = fs::rename(destination, &old) {
            discard_temp(&temp);
            return Err(CaptureError::WriteFailed { path: destination.to_path_buf(), source });
        }
    }

    if let Err(source) = fs::rename(&temp, destination) {
        discard_temp(&temp);
        return Err(CaptureError::WriteFailed { path: destination.to_path_buf(), source });
    }

    if old.exists() {
        if let Err(err) = fs::remove_file(&old) {
            tracing::warn!(path = %old.display(), error = %err, "failed to remove retired snapshot");
        }
    }

    tracing::info!(path = %destination.display(), "snapshot captured");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbRole {
    Primary,
    Secondary,
}

struct RestoreTarget {
    path: PathBuf,
    role: DbRole,
}

/// Apply a snapshot file into every existing state database file.
///
/// The snapshot is validated before any database is touched. Each existing
/// file gets a sibling safety copy first; every file is then restored with
/// one all-or-nothing transaction. A primary failure aborts the whole apply
/// and rolls every file back from its safety copy; a secondary failure is a
/// logged warning only, since only the primary is required for correct
/// operation. Safety copies never outlive the call.
///
/// # Errors
/// Returns [`ApplyError::SourceMissing`] / [`ApplyError::ValidationFailed`]
/// before anything is modified, [`ApplyError::NoDatabaseFound`] when no
/// primary file exists, or [`ApplyError::RestoreFailed`] after rollback.
pub fn apply(
    source: &Path,
    layouts: &[DatabaseLayout],
    options: &DbOptions,
) -> Result<(), ApplyError> {
    if !source.exists() {
        return Err(ApplyError::SourceMissing { path: source.to_path_buf() });
    }
    let snapshot = snapshot::validate_file(source)?;
    let entries = snapshot.known_entries();
    tracing::info!(
        path = %source.display(),
        email = %snapshot.account_email,
        keys = entries.len(),
        "applying snapshot"
    );

    let mut targets = Vec::new();
    for layout in layouts {
        if layout.primary.exists() {
            targets.push(RestoreTarget { path: layout.primary.clone(), role: DbRole::Primary });
        }
        if let Some(secondary) = &layout.secondary {
            if secondary.exists() {
                targets.push(RestoreTarget { path: secondary.clone(), role: DbRole::Secondary });
            }
        }
    }
    if !targets.iter().any(|target| target.role == DbRole::Primary) {
        return Err(ApplyError::NoDatabaseFound);
    }

    // Safety copies for rollback. A file we fail to copy is simply not
    // rollback-able; that is logged, not fatal.
    let mut copies: Vec<(PathBuf, PathBuf)> = Vec::new();
    for target in &targets {
        let copy = sibling(&target.path, SAFETY_SUFFIX);
        match fs::copy(&target.path, &copy) {
            Ok(_) => {
                tracing::debug!(path = %copy.display(), "created safety copy");
                copies.push((target.path.clone(), copy));
            }
            Err(err) => {
                tracing::warn!(path = %target.path.display(), error = %err, "failed to create safety copy");
            }
        }
    }

    let mut failure: Option<(PathBuf, DbError)> = None;
    for target in &targets {
        match restore_one(&target.path, &entries, options) {
            Ok(written) => {
                tracing::info!(path = %target.path.display(), keys = written, "restored state database");
            }
            Err(err) if target.role == DbRole::Secondary => {
                tracing::warn!(
                    path = %target.path.display(),
                    error = %err,
                    "failed to restore secondary database file, continuing"
                );
            }
            Err(err) => {
                failure = Some((target.path.clone(), err));
                break;
            }
        }
    }

    if let Some((path, source)) = failure {
        tracing::error!(path = %path.display(), error = %source, "apply failed, rolling back");
        roll_back(&copies);
        return Err(ApplyError::RestoreFailed { path, source });
    }

    discard_safety_copies(&copies);
    Ok(())
}

fn discard_temp(temp: &Path) {
    if let Err(err) = fs::remove_file(temp) {
        tracing::warn!(path = %temp.display(), error = %err, "failed to remove temp snapshot");
    }
}

fn restore_one(
    path: &Path,
    entries: &[(String, String)],
    options: &DbOptions,
) -> Result<usize, DbError> {
    let mut db = StateDb::open(path, options)?;
    db.write_many(entries)
}

/// Copy every safety copy back over its live file and remove it.
/// Best-effort on both steps; failures are logged per file and do not mask
/// the original apply failure.
fn roll_back(copies: &[(PathBuf, PathBuf)]) {
    for (live, copy) in copies {
        match fs::copy(copy, live) {
            Ok(_) => tracing::info!(path = %live.display(), "rolled back from safety copy"),
            Err(err) => {
                tracing::error!(path = %live.display(), error = %err, "rollback from safety copy failed");
            }
        }
        if let Err(err) = fs::remove_file(copy) {
            tracing::warn!(path = %copy.display(), error = %err, "failed to remove safety copy");
        }
    }
}

fn discard_safety_copies(copies: &[(PathBuf, PathBuf)]) {
    for (_, copy) in copies {
        if let Err(err) = fs::remove_file(copy) {
            tracing::warn!(path = %copy.display(), error = %err, "failed to remove safety copy");
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
