//! Core domain types for the Aether identity switcher: identity records,
//! the snapshot file format and its validity rules, the identity registry,
//! and the tool settings store.
//!
//! This crate performs file I/O only against its own registry, snapshot,
//! and settings files. Talking to the managed application's state database
//! or its processes is left to the sibling crates.

mod atomic_file;
pub mod identity;
pub mod registry;
pub mod settings;
pub mod snapshot;

pub use identity::{IdentityId, IdentityRecord};
pub use registry::{Registry, RegistryError};
pub use settings::{Settings, SettingsError};
pub use snapshot::{
    Snapshot, SnapshotError, KNOWN_STATE_KEYS, MAX_SNAPSHOT_BYTES, SNAPSHOT_VERSION,
};
