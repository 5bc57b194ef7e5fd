//! Tool settings: a JSON file with serde defaults, value clamping, atomic
//! saves, and the same corrupted-file recovery as the registry.
//!
//! The switch engine only ever reads these options; persistence is owned by
//! whichever surface hosts the tool.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atomic_file;

const SETTINGS_FILE: &str = "settings.json";
const SETTINGS_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to write settings file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Named options read by the switch engine. Unknown fields in the file are
/// ignored so older builds can open newer settings files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub version: String,
    /// Snapshot the current identity before every switch.
    pub auto_backup_on_switch: bool,
    /// Seconds to wait for the managed application to exit per stop attempt.
    pub process_close_timeout: u64,
    /// Busy timeout, in seconds, for state database connections.
    pub db_timeout: u64,
    /// Connection attempts against a locked state database.
    pub db_max_retries: u32,
    /// Days to keep unreferenced snapshots around; 0 keeps them forever.
    pub backup_retention_days: u32,
    /// Require confirmation before deleting an identity.
    pub confirm_before_delete: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION.to_string(),
            auto_backup_on_switch: true,
            process_close_timeout: 10,
            db_timeout: 30,
            db_max_retries: 3,
            backup_retention_days: 30,
            confirm_before_delete: true,
        }
    }
}

impl Settings {
    /// Load settings from `data_dir`.
    ///
    /// A missing file yields defaults; an unparsable file is renamed aside
    /// as a corrupted artifact and replaced by defaults. Numeric values
    /// outside their sane ranges are clamped. Never fails.
    #[must_use]
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Self::default();
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read settings, using defaults");
                return Self::default();
            }
        };
        let mut settings: Self = match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "settings file is corrupted, resetting to defaults"
                );
                if let Some(kept) = atomic_file::quarantine(&path) {
                    tracing::warn!(path = %kept.display(), "corrupted settings kept aside");
                }
                Self::default()
            }
        };
        settings.sanitize();
        settings
    }

    /// Atomically persist the settings under `data_dir`.
    ///
    /// # Errors
    /// Returns [`SettingsError::WriteFailed`] when the temp write or rename
    /// fails; the prior settings file is left untouched.
    pub fn save(&self, data_dir: &Path) -> Result<(), SettingsError> {
        let path = data_dir.join(SETTINGS_FILE);
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_file::write_atomic(&path, &bytes)
            .map_err(|source| SettingsError::WriteFailed { path, source })
    }

    /// Force numeric options back into their sane ranges.
    fn sanitize(&mut self) {
        if self.process_close_timeout < 5 {
            self.process_close_timeout = 5;
        }
        if self.db_timeout < 5 {
            self.db_timeout = 5;
        }
        if self.db_max_retries < 1 {
            self.db_max_retries = 1;
        }
    }
}
