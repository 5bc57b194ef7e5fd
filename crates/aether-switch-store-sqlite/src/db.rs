//! Connection handling for the managed application's `state.vscdb`.
//!
//! The database is a plain SQLite file with one `ItemTable (key, value)`
//! table. The application may still hold it when we connect, so opening
//! configures WAL journaling plus a busy timeout and retries lock
//! contention with a linearly increasing backoff. Every other engine error
//! fails immediately.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

const STATE_TABLE: &str = "ItemTable";
const LOCK_BACKOFF_UNIT: Duration = Duration::from_secs(2);

/// Connection options, sourced from the tool settings.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Attempts against a locked database before giving up.
    pub max_retries: u32,
    /// SQLite busy timeout per attempt.
    pub timeout: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self { max_retries: 3, timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("state database still locked after {attempts} attempts: {source}")]
    Locked {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to open state database {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("write transaction failed at key `{key}`: {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// One open connection to a state database file.
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open `path`, configuring WAL journaling and the busy timeout.
    ///
    /// Lock contention is retried up to `options.max_retries` times with a
    /// linearly increasing backoff (2s, 4s, 6s, ...). Any non-lock error
    /// fails on the first attempt.
    ///
    /// # Errors
    /// Returns [`DbError::Locked`] when the retry budget is exhausted, or
    /// [`DbError::Open`] for every other engine failure.
    pub fn open(path: &Path, options: &DbOptions) -> Result<Self, DbError> {
        let max_retries = options.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match try_open(path, options.timeout) {
                Ok(conn) => return Ok(Self { conn }),
                Err(err) if is_locked(&err) => {
                    if attempt >= max_retries {
                        return Err(DbError::Locked { attempts: attempt, source: err });
                    }
                    let backoff = LOCK_BACKOFF_UNIT * attempt;
                    tracing::warn!(
                        path = %path.display(),
                        attempt,
                        max_retries,
                        "state database is locked, retrying in {}s",
                        backoff.as_secs()
                    );
                    thread::sleep(backoff);
                }
                Err(source) => {
                    return Err(DbError::Open { path: path.to_path_buf(), source });
                }
            }
        }
    }

    /// Point read of one key from `ItemTable`.
    ///
    /// Values are stored as TEXT or BLOB depending on which component of
    /// the managed application wrote them; both come back as strings.
    ///
    /// # Errors
    /// Returns [`DbError::Sqlite`] when the query fails.
    pub fn read_state(&self, key: &str) -> Result<Option<String>, DbError> {
        let value = self
            .conn
            .query_row(
                &format!("SELECT value FROM {STATE_TABLE} WHERE key = ?1"),
                params![key],
                |row| row.get::<_, SqlValue>(0),
            )
            .optional()?;
        Ok(value.and_then(render_value))
    }

    /// Upsert every pair in one all-or-nothing transaction.
    ///
    /// The transaction commits only when every single key write succeeded;
    /// otherwise it rolls back as a whole and the error names the failing
    /// key. Returns the number of keys written.
    ///
    /// # Errors
    /// Returns [`DbError::WriteFailed`] naming the key whose statement
    /// failed, or [`DbError::Sqlite`] when the transaction itself fails.
    pub fn write_many(&mut self, pairs: &[(String, String)]) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx
                .prepare(&format!("INSERT OR REPLACE INTO {STATE_TABLE} (key, value) VALUES (?1, ?2)"))?;
            for (key, value) in pairs {
                stmt.execute(params![key, value]).map_err(|source| DbError::WriteFailed {
                    key: key.clone(),
                    source,
                })?;
                tracing::debug!(key, "upserted state key");
            }
        }
        tx.commit()?;
        Ok(pairs.len())
    }
}

fn try_open(path: &Path, timeout: Duration) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {};\nPRAGMA journal_mode = WAL;",
        timeout.as_millis()
    ))?;
    Ok(conn)
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(code.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn render_value(value: SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(text) => Some(text),
        SqlValue::Blob(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        SqlValue::Integer(number) => Some(number.to_string()),
        SqlValue::Real(number) => Some(number.to_string()),
        SqlValue::Null => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn temp_dir() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp dir: {err}"),
        }
    }

    /// Create a state database shaped like the managed application's, with
    /// an optional CHECK constraint used to provoke write failures.
    pub(crate) fn create_state_db(path: &Path, constrained: bool) {
        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to create fixture db: {err}"),
        };
        let schema = if constrained {
            "CREATE TABLE ItemTable (key TEXT PRIMARY KEY, value TEXT CHECK (length(value) < 64))"
        } else {
            "CREATE TABLE ItemTable (key TEXT PRIMARY KEY, value TEXT)"
        };
        if let Err(err) = conn.execute(schema, []) {
            panic!("failed to create ItemTable: {err}");
        }
    }

    pub(crate) fn seed(path: &Path, pairs: &[(&str, &str)]) {
        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open fixture db: {err}"),
        };
        for (key, value) in pairs {
            if let Err(err) = conn.execute(
                "INSERT OR REPLACE INTO ItemTable (key, value) VALUES (?1, ?2)",
                params![key, value],
            ) {
                panic!("failed to seed fixture db: {err}");
            }
        }
    }

    pub(crate) fn quick_options() -> DbOptions {
        DbOptions { max_retries: 1, timeout: Duration::from_millis(100) }
    }

    #[test]
    fn read_state_returns_value_or_absent() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);
        seed(&path, &[("aetherAuthStatus", "{\"email\":\"ada@example.com\"}")]);

        let db = match StateDb::open(&path, &quick_options()) {
            Ok(db) => db,
            Err(err) => panic!("open failed: {err}"),
        };
        let value = match db.read_state("aetherAuthStatus") {
            Ok(value) => value,
            Err(err) => panic!("read failed: {err}"),
        };
        assert_eq!(value.as_deref(), Some("{\"email\":\"ada@example.com\"}"));

        let absent = match db.read_state("missingKey") {
            Ok(value) => value,
            Err(err) => panic!("read failed: {err}"),
        };
        assert_eq!(absent, None);
    }

    #[test]
    fn write_many_commits_all_pairs() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);

        let mut db = match StateDb::open(&path, &quick_options()) {
            Ok(db) => db,
            Err(err) => panic!("open failed: {err}"),
        };
        let pairs = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        match db.write_many(&pairs) {
            Ok(written) => assert_eq!(written, 2),
            Err(err) => panic!("write_many failed: {err}"),
        }
        assert_eq!(db.read_state("b").ok().flatten().as_deref(), Some("2"));
    }

    #[test]
    fn write_many_rolls_back_whole_transaction_on_failure() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, true);
        seed(&path, &[("a", "before")]);

        let mut db = match StateDb::open(&path, &quick_options()) {
            Ok(db) => db,
            Err(err) => panic!("open failed: {err}"),
        };
        let oversized = "x".repeat(200);
        let pairs = vec![
            ("a".to_string(), "after".to_string()),
            ("b".to_string(), oversized),
        ];
        match db.write_many(&pairs) {
            Err(DbError::WriteFailed { key, .. }) => assert_eq!(key, "b"),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("write_many should have failed"),
        }

        // The first pair must not have been committed.
        assert_eq!(db.read_state("a").ok().flatten().as_deref(), Some("before"));
        assert_eq!(db.read_state("b").ok().flatten(), None);
    }

    #[test]
    fn open_fails_fast_on_invalid_database() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        if let Err(err) = std::fs::write(&path, "this is not a sqlite database, not even close") {
            panic!("failed to write bogus db: {err}");
        }

        match StateDb::open(&path, &quick_options()) {
            Err(DbError::Open { .. }) => {}
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("open should have failed"),
        }
    }

    #[test]
    fn open_reports_exhausted_retries_on_lock() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);

        // Hold an exclusive lock from a second connection.
        let blocker = match Connection::open(&path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open blocking connection: {err}"),
        };
        if let Err(err) = blocker.execute_batch("BEGIN EXCLUSIVE") {
            panic!("failed to take exclusive lock: {err}");
        }

        match StateDb::open(&path, &quick_options()) {
            Err(DbError::Locked { attempts, .. }) => assert_eq!(attempts, 1),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("open should have hit the lock"),
        }
    }
}
