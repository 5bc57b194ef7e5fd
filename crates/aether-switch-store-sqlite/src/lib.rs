//! Access to the managed application's embedded state database and the
//! snapshot engine built on top of it.
//!
//! Connections are short-lived: opened for one logical capture or apply
//! step and closed before the process-lifecycle boundary. Nothing here is
//! held across a stop/start of the managed application.

mod db;
mod discovery;
mod engine;

pub use db::{DbError, DbOptions, StateDb};
pub use discovery::{discover_email, AccountProbe};
pub use engine::{apply, capture, ApplyError, CaptureError, DatabaseLayout};
