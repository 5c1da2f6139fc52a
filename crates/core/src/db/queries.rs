//! Typed query helpers for the audit tables.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{AuditRecord, EntityKind, EntitySnapshot, RecordSource, RunStatus};

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A row from the `sync_status` table.
#[derive(Debug, Clone)]
pub struct SyncStatusEntry {
    pub sync_type: String,
    pub last_sync: String,
    pub status: String,
    pub details: String,
    pub run_id: Option<String>,
    pub dry_run: bool,
    pub updated_at: String,
}

impl SyncStatusEntry {
    /// Convert to the model-layer record, parsing timestamps and JSON.
    pub fn to_audit_record(&self) -> Result<AuditRecord, DatabaseError> {
        Ok(AuditRecord {
            sync_type: self.sync_type.clone(),
            last_sync: parse_timestamp(&self.last_sync),
            status: RunStatus::from_str_val(&self.status),
            details: serde_json::from_str(&self.details)?,
        })
    }
}

/// A row from the `entity_snapshots` table.
#[derive(Debug, Clone)]
pub struct EntitySnapshotEntry {
    pub kind: String,
    pub join_key: String,
    pub source_id: String,
    pub source: String,
    pub attributes: String,
    pub updated_at: String,
}

impl EntitySnapshotEntry {
    pub fn to_snapshot(&self) -> Result<EntitySnapshot, DatabaseError> {
        let kind = EntityKind::from_str_val(&self.kind).ok_or_else(|| DatabaseError::NotFound {
            entity: "entity kind".into(),
            id: self.kind.clone(),
        })?;
        let source = match self.source.as_str() {
            "directory" => RecordSource::Directory,
            _ => RecordSource::IdentityProvider,
        };
        Ok(EntitySnapshot {
            kind,
            join_key: self.join_key.clone(),
            source_id: self.source_id.clone(),
            source,
            attributes: serde_json::from_str(&self.attributes)?,
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- entity_snapshots ---------------------------------------------------

    /// Insert or replace the last-known state of one entity.
    pub fn upsert_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), DatabaseError> {
        let attributes = serde_json::to_string(&snapshot.attributes)?;
        let kind = snapshot.kind.to_string();
        let source = snapshot.source.to_string();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO entity_snapshots (kind, join_key, source_id, source, attributes, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, join_key) DO UPDATE SET
                source_id = excluded.source_id,
                source = excluded.source,
                attributes = excluded.attributes,
                updated_at = excluded.updated_at",
            params![
                kind,
                snapshot.join_key,
                snapshot.source_id,
                source,
                attributes,
                snapshot.updated_at.to_rfc3339()
            ],
        )?;
        debug!(kind = %kind, key = %snapshot.join_key, "upserted entity snapshot");
        Ok(())
    }

    /// Fetch one entity snapshot by kind and join key.
    pub fn get_entity_snapshot(
        &self,
        kind: EntityKind,
        join_key: &str,
    ) -> Result<Option<EntitySnapshot>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT kind, join_key, source_id, source, attributes, updated_at
                 FROM entity_snapshots WHERE kind = ?1 AND join_key = ?2",
                params![kind.to_string(), join_key],
                row_to_snapshot_entry,
            )
            .optional()?;
        entry.map(|e| e.to_snapshot()).transpose()
    }

    /// List snapshots of one kind, most recently updated first.
    pub fn list_entity_snapshots(
        &self,
        kind: EntityKind,
        limit: u32,
    ) -> Result<Vec<EntitySnapshotEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT kind, join_key, source_id, source, attributes, updated_at
             FROM entity_snapshots WHERE kind = ?1
             ORDER BY updated_at DESC, join_key ASC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![kind.to_string(), limit], row_to_snapshot_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count stored snapshots, optionally restricted to one kind.
    pub fn count_entity_snapshots(&self, kind: Option<EntityKind>) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count = match kind {
            Some(kind) => conn.query_row(
                "SELECT COUNT(*) FROM entity_snapshots WHERE kind = ?1",
                params![kind.to_string()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM entity_snapshots", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    // -- sync_status --------------------------------------------------------

    /// Overwrite the status row for `sync_type`.
    pub fn set_run_status(
        &self,
        sync_type: &str,
        status: RunStatus,
        details: &serde_json::Value,
        run_id: Option<&str>,
        dry_run: bool,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let details = serde_json::to_string(details)?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_status (sync_type, last_sync, status, details, updated_at, run_id, dry_run)
             VALUES (?1, ?2, ?3, ?4, ?2, ?5, ?6)
             ON CONFLICT(sync_type) DO UPDATE SET
                last_sync = excluded.last_sync,
                status = excluded.status,
                details = excluded.details,
                updated_at = excluded.updated_at,
                run_id = excluded.run_id,
                dry_run = excluded.dry_run",
            params![sync_type, now, status.to_string(), details, run_id, dry_run],
        )?;
        debug!(sync_type, status = %status, "recorded run status");
        Ok(())
    }

    /// Latest status for one run type.
    pub fn get_run_status(&self, sync_type: &str) -> Result<Option<SyncStatusEntry>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                "SELECT sync_type, last_sync, status, details, run_id, dry_run, updated_at
                 FROM sync_status WHERE sync_type = ?1",
                params![sync_type],
                row_to_status_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Latest status for every run type, most recent first.
    pub fn list_run_statuses(&self) -> Result<Vec<SyncStatusEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sync_type, last_sync, status, details, run_id, dry_run, updated_at
             FROM sync_status ORDER BY last_sync DESC",
        )?;
        let entries = stmt
            .query_map([], row_to_status_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn row_to_snapshot_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntitySnapshotEntry> {
    Ok(EntitySnapshotEntry {
        kind: row.get(0)?,
        join_key: row.get(1)?,
        source_id: row.get(2)?,
        source: row.get(3)?,
        attributes: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_status_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncStatusEntry> {
    Ok(SyncStatusEntry {
        sync_type: row.get(0)?,
        last_sync: row.get(1)?,
        status: row.get(2)?,
        details: row.get(3)?,
        run_id: row.get(4)?,
        dry_run: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
