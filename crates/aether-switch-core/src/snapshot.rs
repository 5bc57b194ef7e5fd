//! Snapshot file format: a flat, versioned JSON object holding the captured
//! state-database keys plus capture metadata.
//!
//! Validation is pure and side-effect-free so the same rules gate both a
//! freshly captured file (self-check before it replaces a prior snapshot)
//! and an untrusted input file at restore time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current snapshot format version, embedded as `backup_version`.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Ceiling on snapshot file size. A larger file is treated as damaged
/// rather than parsed.
pub const MAX_SNAPSHOT_BYTES: u64 = 50 * 1024 * 1024;

/// The fixed set of state-database keys a snapshot may carry. Anything
/// else found in a snapshot file is ignored at restore time.
pub const KNOWN_STATE_KEYS: [&str; 3] = [
    "aetherAuthStatus",
    "aetherUserSettings.allUserSettings",
    "workbench.agentSession.initState",
];

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot file not found: {path}")]
    SourceMissing { path: PathBuf },
    #[error("snapshot file is empty")]
    Empty,
    #[error("snapshot file is {size} bytes, above the {MAX_SNAPSHOT_BYTES}-byte ceiling")]
    Oversized { size: u64 },
    #[error("snapshot is not a JSON object: {0}")]
    Malformed(String),
    #[error("snapshot is missing the `{field}` metadata field")]
    MissingMetadata { field: &'static str },
    #[error("snapshot carries none of the known state keys")]
    NoKnownKeys,
    #[error("failed to read snapshot file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to stamp capture time: {0}")]
    Clock(#[from] time::error::Format),
}

/// In-memory form of one snapshot file.
///
/// `entries` holds every non-metadata field found in the file; only the
/// [`KNOWN_STATE_KEYS`] subset is ever written back to a database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub account_email: String,
    pub backup_time: String,
    #[serde(default = "default_version")]
    pub backup_version: String,
    #[serde(flatten)]
    pub entries: BTreeMap<String, Value>,
}

fn default_version() -> String {
    SNAPSHOT_VERSION.to_string()
}

impl Snapshot {
    /// Build a snapshot of `entries` captured now for `email`.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Clock`] when the capture timestamp cannot
    /// be formatted.
    pub fn new(email: &str, entries: BTreeMap<String, String>) -> Result<Self, SnapshotError> {
        Ok(Self {
            account_email: email.to_string(),
            backup_time: OffsetDateTime::now_utc().format(&Rfc3339)?,
            backup_version: default_version(),
            entries: entries.into_iter().map(|(key, value)| (key, Value::String(value))).collect(),
        })
    }

    /// Serialize to the on-disk JSON form.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Malformed`] when serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec_pretty(self).map_err(|err| SnapshotError::Malformed(err.to_string()))
    }

    /// The known state keys present in this snapshot, in fixed key order,
    /// with non-string values stringified for storage.
    #[must_use]
    pub fn known_entries(&self) -> Vec<(String, String)> {
        KNOWN_STATE_KEYS
            .iter()
            .filter_map(|key| {
                self.entries.get(*key).map(|value| {
                    let rendered = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    ((*key).to_string(), rendered)
                })
            })
            .collect()
    }
}

/// Decode snapshot bytes without validating them.
///
/// # Errors
/// Returns [`SnapshotError::Malformed`] when the bytes are not a snapshot
/// object.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    serde_json::from_slice(bytes).map_err(|err| SnapshotError::Malformed(err.to_string()))
}

/// Run the full validity rules over raw snapshot bytes and return the
/// decoded snapshot on success.
///
/// Rules are checked in order, each with its own failure reason: empty
/// file, size ceiling, JSON object shape, required metadata fields, and at
/// least one known state key present.
///
/// # Errors
/// Returns the first [`SnapshotError`] variant whose rule fails.
pub fn validate_bytes(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    if bytes.is_empty() {
        return Err(SnapshotError::Empty);
    }
    let size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if size > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::Oversized { size });
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| SnapshotError::Malformed(err.to_string()))?;
    let Some(object) = value.as_object() else {
        return Err(SnapshotError::Malformed("top level is not an object".to_string()));
    };

    for field in ["account_email", "backup_time"] {
        if !object.get(field).is_some_and(Value::is_string) {
            return Err(SnapshotError::MissingMetadata { field });
        }
    }

    if !KNOWN_STATE_KEYS.iter().any(|key| object.contains_key(*key)) {
        return Err(SnapshotError::NoKnownKeys);
    }

    decode(bytes)
}

/// Validate a snapshot file on disk.
///
/// # Errors
/// Returns [`SnapshotError::SourceMissing`] when the file does not exist,
/// otherwise behaves like [`validate_bytes`].
pub fn validate_file(path: &Path) -> Result<Snapshot, SnapshotError> {
    if !path.exists() {
        return Err(SnapshotError::SourceMissing { path: path.to_path_buf() });
    }
    let bytes = fs::read(path)?;
    validate_bytes(&bytes)
}
