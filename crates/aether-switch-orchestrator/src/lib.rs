//! The switch orchestrator: snapshot the current identity, stop the
//! managed application, apply the target snapshot, update the registry,
//! and start the application again.
//!
//! Every collaborator is an explicitly constructed, injected part; there is
//! no ambient global state. All operations are synchronous and potentially
//! long-running (retry backoff, process-exit polling); interactive surfaces
//! must call them off any UI-responsive thread and must not start a second
//! switch while one is in flight.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use aether_switch_core::{IdentityRecord, Registry, RegistryError, Settings};
use aether_switch_lifecycle::{
    LifecycleController, ProcessError, StartOptions, StopOptions, StopOutcome,
};
use aether_switch_store_sqlite::{
    apply, capture, discover_email, ApplyError, CaptureError, DatabaseLayout, DbOptions, StateDb,
};

/// Placeholder email recorded when the live database yields no account.
pub const UNKNOWN_EMAIL: &str = "unknown";

/// The lifecycle operations the orchestrator needs; implemented by the real
/// [`LifecycleController`] and by test stand-ins.
pub trait AppLifecycle: Send + Sync {
    fn is_running(&self) -> bool;

    /// # Errors
    /// Returns [`ProcessError`] when the staged stop sequence is exhausted.
    fn stop(&self, options: &StopOptions) -> Result<StopOutcome, ProcessError>;

    /// # Errors
    /// Returns [`ProcessError`] when neither launch method works.
    fn start(&self, options: &StartOptions) -> Result<(), ProcessError>;
}

impl AppLifecycle for LifecycleController {
    fn is_running(&self) -> bool {
        Self::is_running(self)
    }

    fn stop(&self, options: &StopOptions) -> Result<StopOutcome, ProcessError> {
        Self::stop(self, options)
    }

    fn start(&self, options: &StartOptions) -> Result<(), ProcessError> {
        Self::start(self, options)
    }
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("identity not found: {id}")]
    NotFound { id: String },
    #[error("snapshot file for identity {id} is missing: {path}")]
    SnapshotMissing { id: String, path: PathBuf },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Soft failures of a switch: stages that went wrong without aborting the
/// data switch itself.
#[derive(Debug, Clone)]
pub enum SwitchWarning {
    AutoBackupFailed(String),
    StopIncomplete(String),
    StartFailed(String),
}

impl Display for SwitchWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoBackupFailed(detail) => {
                write!(f, "auto-backup of the current identity failed: {detail}")
            }
            Self::StopIncomplete(detail) => {
                write!(f, "the application could not be fully stopped: {detail}")
            }
            Self::StartFailed(detail) => {
                write!(f, "the application could not be restarted: {detail}")
            }
        }
    }
}

/// Outcome of a completed switch.
#[derive(Debug)]
pub struct SwitchReport {
    /// The target identity, with `last_used` already refreshed.
    pub identity: IdentityRecord,
    pub warnings: Vec<SwitchWarning>,
}

/// Top-level account switcher.
pub struct Switcher {
    registry: Registry,
    layouts: Vec<DatabaseLayout>,
    lifecycle: Arc<dyn AppLifecycle>,
    settings: Settings,
}

impl Switcher {
    #[must_use]
    pub fn new(
        registry: Registry,
        layouts: Vec<DatabaseLayout>,
        lifecycle: Arc<dyn AppLifecycle>,
        settings: Settings,
    ) -> Self {
        Self { registry, layouts, lifecycle, settings }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// All identities, most recently used first.
    #[must_use]
    pub fn identities(&self) -> Vec<IdentityRecord> {
        self.registry.list()
    }

    /// Switch the installation to the identity `id`.
    ///
    /// Auto-backup, stop, and start failures are downgraded to warnings on
    /// the report; an apply failure aborts the switch and `last_used` stays
    /// untouched.
    ///
    /// # Errors
    /// Returns [`SwitchError::NotFound`] / [`SwitchError::SnapshotMissing`]
    /// before anything runs, or [`SwitchError::Apply`] when the restore
    /// fails (after rollback).
    pub fn switch(&self, id: &str) -> Result<SwitchReport, SwitchError> {
        let target = self
            .registry
            .get(id)
            .ok_or_else(|| SwitchError::NotFound { id: id.to_string() })?;
        if !target.backup_file.exists() {
            return Err(SwitchError::SnapshotMissing {
                id: id.to_string(),
                path: target.backup_file.clone(),
            });
        }
        tracing::info!(name = %target.name, email = %target.email, "switching identity");

        let mut warnings = Vec::new();

        if self.settings.auto_backup_on_switch {
            match self.snapshot_current(None, None) {
                Ok((current, _)) => {
                    tracing::info!(email = %current.email, "auto-backup of current identity done");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "auto-backup of current identity failed, continuing");
                    warnings.push(SwitchWarning::AutoBackupFailed(err.to_string()));
                }
            }
        }

        // A failed stop is a warning, not an abort: the apply below may then
        // contend with a live database lock, which the connection-level
        // retry/backoff is there to absorb.
        if let Err(err) = self.lifecycle.stop(&self.stop_options(None)) {
            tracing::warn!(error = %err, "could not fully stop the application, continuing");
            warnings.push(SwitchWarning::StopIncomplete(err.to_string()));
        }

        apply(&target.backup_file, &self.layouts, &self.db_options())?;

        let identity = self.registry.touch_last_used(id)?;

        if let Err(err) = self.lifecycle.start(&StartOptions::default()) {
            tracing::warn!(error = %err, "application restart failed after switch");
            warnings.push(SwitchWarning::StartFailed(err.to_string()));
        }

        tracing::info!(name = %identity.name, "switch complete");
        Ok(SwitchReport { identity, warnings })
    }

    /// Snapshot the live session as a new or updated identity.
    ///
    /// The email falls back to discovery against the live database and then
    /// to a placeholder; the name defaults to the email's local part. The
    /// registry is only updated once the capture has landed, so a failed
    /// capture never leaves a record pointing at nothing.
    ///
    /// # Errors
    /// Returns [`SwitchError::Capture`] when the capture fails or
    /// [`SwitchError::Registry`] when the registry cannot be saved.
    pub fn snapshot_current(
        &self,
        name: Option<&str>,
        email: Option<&str>,
    ) -> Result<(IdentityRecord, bool), SwitchError> {
        let email = match email {
            Some(email) if !email.trim().is_empty() => email.trim().to_string(),
            _ => self.discover_current_email(),
        };
        let (slot, existed) = self.registry.resolve_slot(&email, name);
        tracing::info!(
            email = %slot.email,
            name = %slot.name,
            existed,
            "capturing current session"
        );

        capture(&email, &self.layouts, &slot.backup_file, &self.db_options())?;
        let record = self.registry.commit(slot)?;
        Ok((record, existed))
    }

    /// Delete an identity and its snapshot file.
    ///
    /// # Errors
    /// Returns [`SwitchError::Registry`] for unknown ids or failed saves.
    pub fn delete(&self, id: &str) -> Result<IdentityRecord, SwitchError> {
        Ok(self.registry.delete(id)?)
    }

    /// Stop the managed application, optionally overriding the configured
    /// timeout.
    ///
    /// # Errors
    /// Returns [`ProcessError`] when the staged stop sequence is exhausted.
    pub fn stop_app(&self, timeout: Option<Duration>) -> Result<StopOutcome, ProcessError> {
        self.lifecycle.stop(&self.stop_options(timeout))
    }

    /// Launch the managed application.
    ///
    /// # Errors
    /// Returns [`ProcessError`] when neither launch method works.
    pub fn start_app(&self) -> Result<(), ProcessError> {
        self.lifecycle.start(&StartOptions::default())
    }

    #[must_use]
    pub fn app_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn discover_current_email(&self) -> String {
        let Some(primary) =
            self.layouts.iter().map(|layout| &layout.primary).find(|path| path.exists())
        else {
            return UNKNOWN_EMAIL.to_string();
        };
        match StateDb::open(primary, &self.db_options()) {
            Ok(db) => discover_email(&db).unwrap_or_else(|| {
                tracing::warn!("no account email discoverable, using placeholder");
                UNKNOWN_EMAIL.to_string()
            }),
            Err(err) => {
                tracing::warn!(error = %err, "could not open state database for discovery");
                UNKNOWN_EMAIL.to_string()
            }
        }
    }

    fn db_options(&self) -> DbOptions {
        DbOptions {
            max_retries: self.settings.db_max_retries,
            timeout: Duration::from_secs(self.settings.db_timeout),
        }
    }

    fn stop_options(&self, timeout: Option<Duration>) -> StopOptions {
        StopOptions {
            timeout: timeout
                .unwrap_or_else(|| Duration::from_secs(self.settings.process_close_timeout)),
            ..StopOptions::default()
        }
    }
}
