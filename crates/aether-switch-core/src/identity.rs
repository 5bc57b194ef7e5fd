//! Identity records: one per logical account the managed application can
//! be switched into.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Opaque identifier for one switchable identity. Generated once, immutable
/// for the life of the record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IdentityId(pub Ulid);

impl IdentityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse an id from its canonical string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for IdentityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One switchable identity and the snapshot file that backs it.
///
/// Field names are the on-disk registry contract; renaming them breaks
/// existing registry files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityRecord {
    pub id: IdentityId,
    /// User-facing display name, mutable.
    pub name: String,
    /// Discovered or user-supplied account email. At most one record may
    /// hold a given non-empty email; the registry enforces this on insert.
    pub email: String,
    /// Absolute path of this identity's snapshot file, stable for the life
    /// of the record.
    pub backup_file: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Updated on every successful apply of this identity's snapshot.
    #[serde(with = "time::serde::rfc3339")]
    pub last_used: OffsetDateTime,
}

/// Default display name for an account email: the local part, or a fixed
/// fallback when the email has no usable local part.
#[must_use]
pub fn default_display_name(email: &str) -> String {
    let local = email.split('@').next().unwrap_or("");
    if local.is_empty() {
        "identity".to_string()
    } else {
        local.to_string()
    }
}
