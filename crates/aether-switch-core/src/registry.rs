//! Persisted collection of identities and their snapshot files.
//!
//! The registry is one JSON file mapping id to record. Writes go through a
//! temp file and an atomic rename, so the file on disk is always either the
//! previous or the new fully-written version. An unparsable file is set
//! aside and treated as empty rather than surfaced to callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use time::OffsetDateTime;

use crate::atomic_file;
use crate::identity::{default_display_name, IdentityId, IdentityRecord};
use crate::snapshot::{self, SnapshotError};

const REGISTRY_FILE: &str = "identities.json";
const BACKUPS_DIR: &str = "backups";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("identity not found: {id}")]
    NotFound { id: String },
    #[error("failed to write registry file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to prepare registry directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Registry of known identities, keyed by id, backed by one JSON file.
///
/// All load/save paths are serialized by an in-process lock. The lock gives
/// no cross-process exclusion: two concurrent instances of the tool writing
/// the same registry may race.
pub struct Registry {
    file: PathBuf,
    backups_dir: PathBuf,
    lock: Mutex<()>,
}

impl Registry {
    /// Open the registry under `data_dir`, creating the directory layout on
    /// first use.
    ///
    /// # Errors
    /// Returns [`RegistryError::DataDir`] when the directories cannot be
    /// created.
    pub fn open(data_dir: &Path) -> Result<Self, RegistryError> {
        let backups_dir = data_dir.join(BACKUPS_DIR);
        fs::create_dir_all(&backups_dir)
            .map_err(|source| RegistryError::DataDir { path: backups_dir.clone(), source })?;
        Ok(Self { file: data_dir.join(REGISTRY_FILE), backups_dir, lock: Mutex::new(()) })
    }

    /// Directory snapshot files are allocated under.
    #[must_use]
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Load every identity record.
    ///
    /// A registry file that fails to parse is renamed aside as a corrupted
    /// artifact and treated as an empty registry; load itself never fails.
    #[must_use]
    pub fn load(&self) -> BTreeMap<String, IdentityRecord> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> BTreeMap<String, IdentityRecord> {
        if !self.file.exists() {
            return BTreeMap::new();
        }
        let raw = match fs::read_to_string(&self.file) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(
                    path = %self.file.display(),
                    error = %err,
                    "failed to read registry file, treating as empty"
                );
                return BTreeMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(
                    path = %self.file.display(),
                    error = %err,
                    "registry file is corrupted, resetting to empty"
                );
                if let Some(kept) = atomic_file::quarantine(&self.file) {
                    tracing::warn!(path = %kept.display(), "corrupted registry kept aside");
                }
                BTreeMap::new()
            }
        }
    }

    /// Atomically persist the full set of records.
    ///
    /// # Errors
    /// Returns [`RegistryError::WriteFailed`] when the temp write or rename
    /// fails; the prior registry file is left untouched.
    pub fn save(&self, records: &BTreeMap<String, IdentityRecord>) -> Result<(), RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.save_unlocked(records)
    }

    fn save_unlocked(&self, records: &BTreeMap<String, IdentityRecord>) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(records)?;
        atomic_file::write_atomic(&self.file, &bytes)
            .map_err(|source| RegistryError::WriteFailed { path: self.file.clone(), source })
    }

    /// Resolve the record a snapshot of `email` should land in, without
    /// persisting anything.
    ///
    /// A record holding the same non-empty email is reused in place (same
    /// id, same backup file, creation time preserved; the name changes only
    /// when a new one is supplied). Otherwise a fresh id and backup path
    /// are allocated. Returns whether the record already existed.
    #[must_use]
    pub fn resolve_slot(&self, email: &str, name: Option<&str>) -> (IdentityRecord, bool) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let records = self.load_unlocked();
        let now = OffsetDateTime::now_utc();

        let existing = records
            .values()
            .find(|record| !record.email.is_empty() && record.email == email)
            .cloned();
        if let Some(mut record) = existing {
            if let Some(name) = name {
                record.name = name.to_string();
            }
            record.last_used = now;
            return (record, true);
        }

        let id = IdentityId::new();
        let record = IdentityRecord {
            id,
            name: name.map_or_else(|| default_display_name(email), ToString::to_string),
            email: email.to_string(),
            backup_file: self.backups_dir.join(format!("{id}.json")),
            created_at: now,
            last_used: now,
        };
        (record, false)
    }

    /// Insert or replace `record`, enforcing the email uniqueness
    /// invariant: any other record holding the same non-empty email is
    /// dropped before the insert.
    ///
    /// # Errors
    /// Returns [`RegistryError::WriteFailed`] when the save fails.
    pub fn commit(&self, record: IdentityRecord) -> Result<IdentityRecord, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.load_unlocked();

        if !record.email.is_empty() {
            let record_id = record.id.to_string();
            let duplicates: Vec<String> = records
                .iter()
                .filter(|(id, other)| other.email == record.email && **id != record_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in duplicates {
                tracing::warn!(%id, email = %record.email, "dropping duplicate identity for the same email");
                records.remove(&id);
            }
        }

        records.insert(record.id.to_string(), record.clone());
        self.save_unlocked(&records)?;
        Ok(record)
    }

    /// Insert or update the identity for `email` in one step.
    ///
    /// # Errors
    /// Returns [`RegistryError::WriteFailed`] when the save fails.
    pub fn upsert_by_email(
        &self,
        email: &str,
        name: Option<&str>,
    ) -> Result<(IdentityRecord, bool), RegistryError> {
        let (record, existed) = self.resolve_slot(email, name);
        let record = self.commit(record)?;
        Ok((record, existed))
    }

    /// Look up one identity by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<IdentityRecord> {
        self.load().get(id).cloned()
    }

    /// Update `last_used` after a successful apply and persist the change.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown ids or
    /// [`RegistryError::WriteFailed`] when the save fails.
    pub fn touch_last_used(&self, id: &str) -> Result<IdentityRecord, RegistryError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.load_unlocked();
        let record = records
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        record.last_used = OffsetDateTime::now_utc();
        let updated = record.clone();
        self.save_unlocked(&records)?;
        Ok(updated)
    }

    /// Remove an identity and best-effort delete its snapshot file. A
    /// failed file deletion is logged, not fatal to the registry mutation.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] for unknown ids or
    /// [`RegistryError::WriteFailed`] when the save fails.
    pub fn delete(&self, id: &str) -> Result<IdentityRecord, RegistryError> {
        let removed = {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut records = self.load_unlocked();
            let record = records
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
            self.save_unlocked(&records)?;
            record
        };

        if removed.backup_file.exists() {
            if let Err(err) = fs::remove_file(&removed.backup_file) {
                tracing::warn!(
                    path = %removed.backup_file.display(),
                    error = %err,
                    "failed to delete snapshot file, leaving it behind"
                );
            }
        }
        Ok(removed)
    }

    /// All identities, most recently used first.
    #[must_use]
    pub fn list(&self) -> Vec<IdentityRecord> {
        let mut records: Vec<IdentityRecord> = self.load().into_values().collect();
        records.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        records
    }

    /// Snapshot files in the backups directory that no record references.
    #[must_use]
    pub fn orphaned_snapshots(&self) -> Vec<PathBuf> {
        let referenced: BTreeSet<PathBuf> =
            self.load().values().map(|record| record.backup_file.clone()).collect();
        let mut orphans = Vec::new();
        let Ok(entries) = fs::read_dir(&self.backups_dir) else {
            return orphans;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && !referenced.contains(&path) {
                orphans.push(path);
            }
        }
        orphans.sort();
        orphans
    }

    /// Best-effort removal of orphaned snapshot files. Returns how many
    /// files were removed; failures are logged and skipped.
    pub fn remove_orphaned_snapshots(&self) -> usize {
        let mut removed = 0;
        for path in self.orphaned_snapshots() {
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed orphaned snapshot");
                    removed += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to remove orphaned snapshot");
                }
            }
        }
        removed
    }

    /// Validate every identity's snapshot file against the snapshot rules.
    #[must_use]
    pub fn verify_snapshots(&self) -> Vec<(IdentityRecord, Result<(), SnapshotError>)> {
        self.list()
            .into_iter()
            .map(|record| {
                let result = snapshot::validate_file(&record.backup_file).map(|_| ());
                (record, result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_registry(dir: &Path) -> Registry {
        match Registry::open(dir) {
            Ok(registry) => registry,
            Err(err) => panic!("failed to open registry: {err}"),
        }
    }

    fn temp_dir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        }
    }

    fn upsert(registry: &Registry, email: &str, name: Option<&str>) -> (IdentityRecord, bool) {
        match registry.upsert_by_email(email, name) {
            Ok(result) => result,
            Err(err) => panic!("upsert failed: {err}"),
        }
    }

    #[test]
    fn upsert_reuses_record_for_same_email() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());

        let (first, existed) = upsert(&registry, "ada@example.com", Some("Ada"));
        assert!(!existed);

        let (second, existed) = upsert(&registry, "ada@example.com", Some("Ada Lovelace"));
        assert!(existed);
        assert_eq!(second.id, first.id);
        assert_eq!(second.backup_file, first.backup_file);
        assert_eq!(second.name, "Ada Lovelace");
        assert_eq!(registry.load().len(), 1);
    }

    #[test]
    fn upsert_keeps_name_when_none_supplied() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());

        upsert(&registry, "ada@example.com", Some("Ada"));
        let (updated, existed) = upsert(&registry, "ada@example.com", None);
        assert!(existed);
        assert_eq!(updated.name, "Ada");
    }

    #[test]
    fn distinct_emails_get_distinct_records() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());

        let (a, _) = upsert(&registry, "a@example.com", None);
        let (b, _) = upsert(&registry, "b@example.com", None);
        assert_ne!(a.id, b.id);
        assert_ne!(a.backup_file, b.backup_file);
        assert_eq!(registry.load().len(), 2);
    }

    #[test]
    fn corrupted_registry_is_quarantined_and_treated_as_empty() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());
        let file = dir.path().join(REGISTRY_FILE);
        if let Err(err) = fs::write(&file, "{ not json") {
            panic!("failed to write corrupted registry: {err}");
        }

        assert!(registry.load().is_empty());
        assert!(!file.exists());
        assert!(dir.path().join(format!("{REGISTRY_FILE}.corrupted")).exists());

        // The registry keeps working after recovery.
        let (record, existed) = upsert(&registry, "ada@example.com", None);
        assert!(!existed);
        assert_eq!(registry.get(&record.id.to_string()).map(|r| r.email), Some(record.email));
    }

    #[test]
    fn stray_temp_file_does_not_affect_load_or_save() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());
        let (record, _) = upsert(&registry, "ada@example.com", None);

        // Simulate a crash between temp-write and rename: a stale temp file
        // next to a valid registry.
        let stray = dir.path().join(format!("{REGISTRY_FILE}.tmp"));
        if let Err(err) = fs::write(&stray, "garbage") {
            panic!("failed to write stray temp file: {err}");
        }

        let records = registry.load();
        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&record.id.to_string()));

        if let Err(err) = registry.save(&records) {
            panic!("save over stray temp file failed: {err}");
        }
        assert!(!stray.exists());
    }

    #[test]
    fn failed_save_preserves_previous_registry_content() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());
        upsert(&registry, "ada@example.com", None);
        let before = registry.load();

        // A directory squatting on the temp path makes the next save fail.
        let blocker = dir.path().join(format!("{REGISTRY_FILE}.tmp"));
        if let Err(err) = fs::create_dir(&blocker) {
            panic!("failed to create blocking dir: {err}");
        }

        let mut updated = before.clone();
        for record in updated.values_mut() {
            record.name = "changed".to_string();
        }
        assert!(matches!(registry.save(&updated), Err(RegistryError::WriteFailed { .. })));

        if let Err(err) = fs::remove_dir(&blocker) {
            panic!("failed to remove blocking dir: {err}");
        }
        assert_eq!(registry.load(), before);
    }

    #[test]
    fn delete_removes_record_and_snapshot_file() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());
        let (record, _) = upsert(&registry, "ada@example.com", None);
        if let Err(err) = fs::write(&record.backup_file, "{}") {
            panic!("failed to write snapshot file: {err}");
        }

        let removed = match registry.delete(&record.id.to_string()) {
            Ok(removed) => removed,
            Err(err) => panic!("delete failed: {err}"),
        };
        assert_eq!(removed.id, record.id);
        assert!(!record.backup_file.exists());
        assert!(registry.load().is_empty());

        assert!(matches!(
            registry.delete(&record.id.to_string()),
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[test]
    fn orphaned_snapshots_are_listed_and_removed() {
        let dir = temp_dir();
        let registry = open_registry(dir.path());
        let (record, _) = upsert(&registry, "ada@example.com", None);
        if let Err(err) = fs::write(&record.backup_file, "{}") {
            panic!("failed to write snapshot file: {err}");
        }
        let orphan = registry.backups_dir().join("orphan.json");
        if let Err(err) = fs::write(&orphan, "{}") {
            panic!("failed to write orphan file: {err}");
        }

        assert_eq!(registry.orphaned_snapshots(), vec![orphan.clone()]);
        assert_eq!(registry.remove_orphaned_snapshots(), 1);
        assert!(!orphan.exists());
        assert!(record.backup_file.exists());
    }
}
