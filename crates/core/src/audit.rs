//! Audit recording seam between the reconciler and durable storage.

use tracing::debug;

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{EntitySnapshot, RunStatus};

/// Details key holding the run's id. Stored in its own column.
pub const DETAILS_RUN_ID: &str = "run_id";

/// Details key holding the run's dry-run flag. Stored in its own column.
pub const DETAILS_DRY_RUN: &str = "dry_run";

/// Durable record of per-entity state and per-run outcome.
///
/// Implementations are called from async code but are expected to be quick
/// local writes, so the methods are synchronous.
pub trait AuditRecorder: Send + Sync {
    /// Make the store ready for writes (open, migrate).
    fn initialize(&self) -> Result<(), DatabaseError>;

    /// Insert or replace the last-known state of one entity.
    fn upsert_entity_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), DatabaseError>;

    /// Overwrite the outcome stored for `run_type`. `details` carries
    /// [`DETAILS_RUN_ID`] and [`DETAILS_DRY_RUN`] alongside the counters.
    fn record_run_status(
        &self,
        run_type: &str,
        status: RunStatus,
        details: &serde_json::Value,
    ) -> Result<(), DatabaseError>;
}

impl AuditRecorder for Database {
    fn initialize(&self) -> Result<(), DatabaseError> {
        Database::initialize(self)
    }

    fn upsert_entity_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), DatabaseError> {
        self.upsert_snapshot(snapshot)
    }

    fn record_run_status(
        &self,
        run_type: &str,
        status: RunStatus,
        details: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let run_id = details.get(DETAILS_RUN_ID).and_then(|v| v.as_str());
        let dry_run = details
            .get(DETAILS_DRY_RUN)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        debug!(run_type, status = %status, "writing audit record");
        self.set_run_status(run_type, status, details, run_id, dry_run)
    }
}
