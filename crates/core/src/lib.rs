//! idsync core library.
//!
//! This crate provides the components of a one-way identity reconciliation
//! from a cloud identity provider into an LDAP directory: configuration,
//! the record model, attribute mapping, the diff engine, the reconciler,
//! the SQLite audit store, and the provider and directory clients.

pub mod audit;
pub mod config;
pub mod db;
pub mod diff;
pub mod directory;
pub mod errors;
pub mod mapping;
pub mod models;
pub mod reconcile;
pub mod report;
pub mod source;

// Re-exports for convenience.
pub use audit::AuditRecorder;
pub use config::AppConfig;
pub use db::Database;
pub use directory::{DirectoryTarget, LdapDirectory};
pub use reconcile::{Phases, Reconciler, RunOptions, RunOutcome};
pub use report::render_report;
pub use source::{IdcsSource, IdentitySource};
