//! Error types for the idsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`.
//! [`SyncError`] wraps the source and audit store errors raised while a
//! reconciler is being built.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Identity provider errors
// ---------------------------------------------------------------------------

/// Errors from the identity provider (IDCS REST API) client.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("identity provider HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("identity provider API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// Token acquisition failed.
    #[error("identity provider authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The request did not complete in time.
    #[error("identity provider request timed out: {0}")]
    Timeout(String),

    /// JSON deserialization failure.
    #[error("identity provider response parse error: {0}")]
    ParseError(String),
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Errors from the local directory (LDAP) client.
///
/// `NotFound`, `AlreadyExists` and the connectivity variants are kept
/// distinct so callers can react to each.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The addressed entry does not exist.
    #[error("{kind} '{key}' not found in directory")]
    NotFound { kind: String, key: String },

    /// An entry with the same key already exists.
    #[error("{kind} '{key}' already exists in directory")]
    AlreadyExists { kind: String, key: String },

    /// The server could not be reached or the bind was refused.
    #[error("directory connectivity error: {0}")]
    Connectivity(String),

    /// An operation exceeded its time limit.
    #[error("directory operation timed out: {0}")]
    Timeout(String),

    /// The server answered with an unexpected result code.
    #[error("directory protocol error (rc {code}): {detail}")]
    Protocol { code: u32, detail: String },
}

impl DirectoryError {
    /// True for errors caused by the network or server availability.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the reconciliation engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Synchronization is switched off in the configuration.
    #[error("synchronization is disabled in configuration")]
    Disabled,

    /// Another run is already in progress.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// A collaborator could not be acquired during INIT.
    #[error("initialization of {stage} failed: {detail}")]
    Init { stage: String, detail: String },

    /// A whole phase could not run (snapshot fetch failed).
    #[error("{phase} phase failed: {detail}")]
    PhaseFailed { phase: String, detail: String },

    /// The same join key appeared more than once in one snapshot.
    #[error("duplicate {kind} key '{key}' in {side} snapshot")]
    DuplicateKey {
        kind: String,
        key: String,
        side: String,
    },

    /// Underlying identity provider error.
    #[error("sync source error: {0}")]
    SourceError(#[from] SourceError),

    /// Audit store error.
    #[error("sync database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// A field mapping expression could not be parsed.
    #[error("invalid mapping expression '{expr}': {detail}")]
    InvalidMapping { expr: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite audit store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Stored JSON could not be encoded or decoded.
    #[error("database serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = DirectoryError::NotFound {
            kind: "user".into(),
            key: "alice".into(),
        };
        assert_eq!(err.to_string(), "user 'alice' not found in directory");

        let err = DirectoryError::AlreadyExists {
            kind: "group".into(),
            key: "eng".into(),
        };
        assert!(err.to_string().contains("already exists"));

        let err = ConfigError::EnvVarMissing {
            var: "IDCS_CLIENT_SECRET".into(),
            field: "source.client_secret_env".into(),
        };
        assert!(err.to_string().contains("IDCS_CLIENT_SECRET"));

        assert_eq!(
            SyncError::Disabled.to_string(),
            "synchronization is disabled in configuration"
        );
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(DirectoryError::Connectivity("refused".into()).is_connectivity());
        assert!(DirectoryError::Timeout("search".into()).is_connectivity());
        assert!(!DirectoryError::NotFound {
            kind: "user".into(),
            key: "x".into()
        }
        .is_connectivity());
    }

    #[test]
    fn test_sync_error_wraps_construction_failures() {
        let err: SyncError = DatabaseError::MigrationFailed {
            version: 2,
            detail: "disk full".into(),
        }
        .into();
        assert!(matches!(err, SyncError::DatabaseError(_)));
        assert!(err.to_string().contains("disk full"));

        let err: SyncError = SourceError::AuthenticationFailed("bad client".into()).into();
        assert!(matches!(err, SyncError::SourceError(_)));
    }
}
