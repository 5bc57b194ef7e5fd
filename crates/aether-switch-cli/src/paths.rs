//! Default locations: the tool's own data directory and the managed
//! installation's state database files.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use aether_switch_store_sqlite::DatabaseLayout;

const TOOL_DIR: &str = "aether-switch";
const STATE_DB_RELATIVE: [&str; 4] = ["Aether", "User", "globalStorage", "state.vscdb"];

/// Where the registry, snapshots, and settings live by default.
///
/// # Errors
/// Fails when the platform exposes no per-user data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(TOOL_DIR))
        .ok_or_else(|| anyhow!("could not determine a per-user data directory"))
}

/// The state database layouts to operate on. An explicit override wins;
/// otherwise the platform-default install location is used. Either way the
/// application's conventional `.backup` sibling is included as the
/// secondary file.
#[must_use]
pub fn state_db_layouts(override_path: Option<PathBuf>) -> Vec<DatabaseLayout> {
    let primary = override_path.or_else(default_state_db);
    match primary {
        Some(path) => vec![DatabaseLayout::with_default_secondary(path)],
        None => Vec::new(),
    }
}

fn default_state_db() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    for part in STATE_DB_RELATIVE {
        path.push(part);
    }
    Some(path)
}
