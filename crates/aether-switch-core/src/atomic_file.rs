//! Write-to-temp-plus-rename helpers shared by the registry and settings
//! files. The file at the target path is always either the previous or the
//! new fully-written version, never a partial write.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Write `bytes` to `path` via a sibling temp file and an atomic rename.
///
/// On failure the temp file is removed (best-effort) and the previous
/// contents of `path` are left untouched.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = sibling(path, ".tmp");
    let result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %tmp.display(), error = %err, "failed to remove temp file");
            }
        }
    }
    result
}

/// Rename an unparsable file aside as `<path>.corrupted` so it can be
/// inspected later. Best-effort: a failed rename is logged and `None` is
/// returned.
pub(crate) fn quarantine(path: &Path) -> Option<PathBuf> {
    let target = sibling(path, ".corrupted");
    match fs::rename(path, &target) {
        Ok(()) => Some(target),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to set corrupted file aside");
            None
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_previous_content() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let path = dir.path().join("target.json");
        if let Err(err) = fs::write(&path, b"old") {
            panic!("failed to seed target file: {err}");
        }

        if let Err(err) = write_atomic(&path, b"new") {
            panic!("atomic write failed: {err}");
        }

        let content = fs::read(&path).unwrap_or_default();
        assert_eq!(content, b"new");
        assert!(!sibling(&path, ".tmp").exists());
    }

    #[test]
    fn write_atomic_failure_keeps_previous_content() {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        };
        let path = dir.path().join("target.json");
        if let Err(err) = fs::write(&path, b"old") {
            panic!("failed to seed target file: {err}");
        }
        // A directory squatting on the temp path forces the write to fail.
        if let Err(err) = fs::create_dir(sibling(&path, ".tmp")) {
            panic!("failed to create blocking dir: {err}");
        }

        assert!(write_atomic(&path, b"new").is_err());
        let content = fs::read(&path).unwrap_or_default();
        assert_eq!(content, b"old");
    }
}
