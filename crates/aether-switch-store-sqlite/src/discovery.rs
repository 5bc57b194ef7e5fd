//! Account discovery: figure out which account email the live state
//! database currently belongs to.
//!
//! A fixed, ordered list of probes replaces guesswork: each probe names one
//! storage key and one extraction shape, parses the stored JSON, and
//! returns an optional email. The first hit wins.

use serde_json::Value;

use crate::db::StateDb;

const EMAIL_FIELD: &str = "email";

/// One known place an account email may live in the state database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountProbe {
    /// `aetherAuthStatus`: a direct `email` field, with a case-insensitive
    /// top-level scan as fallback for older status payloads.
    AuthStatus,
    /// `aether.cloudAccount`: a direct `email` field.
    CloudAccount,
    /// `aetherUserSettings.allUserSettings`: a direct `email` field.
    UserSettings,
}

impl AccountProbe {
    /// Probes in the order they are tried.
    pub const PRIORITY: [Self; 3] = [Self::AuthStatus, Self::CloudAccount, Self::UserSettings];

    /// The state-database key this probe reads.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::AuthStatus => "aetherAuthStatus",
            Self::CloudAccount => "aether.cloudAccount",
            Self::UserSettings => "aetherUserSettings.allUserSettings",
        }
    }

    fn extract(self, value: &Value) -> Option<String> {
        let object = value.as_object()?;
        let direct = object.get(EMAIL_FIELD).and_then(Value::as_str);
        match self {
            Self::AuthStatus => direct
                .map(ToString::to_string)
                .or_else(|| {
                    object.iter().find_map(|(key, value)| {
                        if key.eq_ignore_ascii_case(EMAIL_FIELD) {
                            value.as_str().map(ToString::to_string)
                        } else {
                            None
                        }
                    })
                }),
            Self::CloudAccount | Self::UserSettings => direct.map(ToString::to_string),
        }
    }
}

/// Try every probe in priority order against an open state database.
///
/// Read failures and unparsable values are skipped, not surfaced; a
/// database with no discoverable email simply yields `None`.
#[must_use]
pub fn discover_email(db: &StateDb) -> Option<String> {
    for probe in AccountProbe::PRIORITY {
        let raw = match db.read_state(probe.key()) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(err) => {
                tracing::debug!(key = probe.key(), error = %err, "account probe read failed");
                continue;
            }
        };
        let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        match probe.extract(&parsed) {
            Some(email) if !email.is_empty() => {
                tracing::debug!(key = probe.key(), "discovered account email");
                return Some(email);
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_state_db, quick_options, seed, temp_dir};

    fn open_db(path: &std::path::Path) -> StateDb {
        match StateDb::open(path, &quick_options()) {
            Ok(db) => db,
            Err(err) => panic!("open failed: {err}"),
        }
    }

    #[test]
    fn auth_status_probe_wins_over_later_probes() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);
        seed(
            &path,
            &[
                ("aetherAuthStatus", r#"{"email":"auth@example.com"}"#),
                ("aether.cloudAccount", r#"{"email":"cloud@example.com"}"#),
            ],
        );

        assert_eq!(discover_email(&open_db(&path)).as_deref(), Some("auth@example.com"));
    }

    #[test]
    fn auth_status_scan_is_case_insensitive() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);
        seed(&path, &[("aetherAuthStatus", r#"{"Email":"mixed@example.com","token":"t"}"#)]);

        assert_eq!(discover_email(&open_db(&path)).as_deref(), Some("mixed@example.com"));
    }

    #[test]
    fn falls_through_unparsable_values_to_later_probes() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);
        seed(
            &path,
            &[
                ("aetherAuthStatus", "opaque-token-not-json"),
                ("aetherUserSettings.allUserSettings", r#"{"email":"settings@example.com"}"#),
            ],
        );

        assert_eq!(discover_email(&open_db(&path)).as_deref(), Some("settings@example.com"));
    }

    #[test]
    fn yields_none_when_nothing_matches() {
        let dir = temp_dir();
        let path = dir.path().join("state.vscdb");
        create_state_db(&path, false);
        seed(&path, &[("aetherAuthStatus", r#"{"token":"t"}"#)]);

        assert_eq!(discover_email(&open_db(&path)), None);
    }
}
