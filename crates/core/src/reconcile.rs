//! One-way reconciliation from the identity provider into the directory.
//!
//! The [`Reconciler`] drives a single pass as a small state machine:
//!
//! 1. INIT: make the identity provider, the directory and the audit store
//!    usable. Any failure here ends the run with status `error`.
//! 2. USERS: fetch both user snapshots, diff them and apply the plan.
//! 3. GROUPS: the same for groups.
//! 4. FINALIZE: derive the overall status and write one audit record.
//!
//! A failure applying one entity is recorded in [`SyncStats`] and the run
//! moves on. A failed snapshot fetch abandons only that phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecorder, DETAILS_DRY_RUN, DETAILS_RUN_ID};
use crate::config::{AppConfig, SyncConfig};
use crate::diff::{diff, Action, Diffable, Modification, Rejection, SourceStep};
use crate::db::Database;
use crate::directory::{DirectoryTarget, LdapDirectory};
use crate::errors::{DirectoryError, SourceError, SyncError};
use crate::mapping::{AttributeMapper, MappableRecord};
use crate::models::{
    EntityKind, EntitySnapshot, GroupRecord, IdentityRecord, RunStatus, RunType, SyncStats,
    TargetAttributes,
};
use crate::source::{IdcsSource, IdentitySource};

// ---------------------------------------------------------------------------
// Run options and outcome
// ---------------------------------------------------------------------------

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phases {
    #[default]
    All,
    UsersOnly,
    GroupsOnly,
}

impl Phases {
    pub fn includes_users(&self) -> bool {
        matches!(self, Self::All | Self::UsersOnly)
    }

    pub fn includes_groups(&self) -> bool {
        matches!(self, Self::All | Self::GroupsOnly)
    }

    /// Key under which the run's audit record is stored.
    pub fn run_type(&self) -> RunType {
        match self {
            Self::All => RunType::FullSync,
            Self::UsersOnly => RunType::UsersSync,
            Self::GroupsOnly => RunType::GroupsSync,
        }
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub dry_run: bool,
    pub phases: Phases,
    pub delete_missing_users: bool,
    pub delete_missing_groups: bool,
}

impl RunOptions {
    /// Options taken straight from the `[sync]` section.
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            dry_run: sync.dry_run,
            phases: Phases::All,
            delete_missing_users: sync.delete_missing_users,
            delete_missing_groups: sync.delete_missing_groups,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub stats: SyncStats,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunOutcome {
    /// Process exit code: 0 only for a clean run.
    pub fn exit_code(&self) -> u8 {
        if self.status == RunStatus::Success && !self.stats.has_errors() {
            0
        } else {
            1
        }
    }

    /// Audit details blob for this run: the stats plus [`DETAILS_RUN_ID`],
    /// [`DETAILS_DRY_RUN`], `started_at` and `completed_at`.
    pub fn details(&self) -> serde_json::Value {
        let mut details = self.stats.to_details();
        if let Some(obj) = details.as_object_mut() {
            obj.insert(DETAILS_RUN_ID.into(), self.run_id.clone().into());
            obj.insert(DETAILS_DRY_RUN.into(), self.dry_run.into());
            obj.insert("started_at".into(), self.started_at.to_rfc3339().into());
            obj.insert("completed_at".into(), self.completed_at.to_rfc3339().into());
        }
        details
    }
}

/// Overall status from the accumulated errors and whether a phase could not run.
pub fn overall_status(stats: &SyncStats, phase_failed: bool) -> RunStatus {
    if phase_failed && stats.total_processed() == 0 {
        RunStatus::Error
    } else if stats.has_errors() {
        RunStatus::PartialFailure
    } else {
        RunStatus::Success
    }
}

// ---------------------------------------------------------------------------
// Per-kind operations
// ---------------------------------------------------------------------------

/// The kind-specific half of a phase: where snapshots come from and which
/// directory calls apply a plan.
#[async_trait]
trait Reconcilable: Diffable + MappableRecord + Send + Sync + Sized {
    fn snapshot(&self) -> EntitySnapshot;

    /// Bring a source record to the shape the directory stores.
    fn normalize(&mut self, _directory: &dyn DirectoryTarget) {}

    async fn fetch_source(source: &dyn IdentitySource) -> Result<Vec<Self>, SourceError>;

    async fn fetch_target(directory: &dyn DirectoryTarget) -> Result<Vec<Self>, DirectoryError>;

    async fn create(
        &self,
        directory: &dyn DirectoryTarget,
        attrs: &TargetAttributes,
    ) -> Result<(), DirectoryError>;

    async fn modify(
        &self,
        directory: &dyn DirectoryTarget,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError>;

    async fn delete(&self, directory: &dyn DirectoryTarget) -> Result<(), DirectoryError>;
}

#[async_trait]
impl Reconcilable for IdentityRecord {
    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::from_user(self)
    }

    fn normalize(&mut self, directory: &dyn DirectoryTarget) {
        directory.normalize_user(self);
    }

    async fn fetch_source(source: &dyn IdentitySource) -> Result<Vec<Self>, SourceError> {
        source.list_users().await
    }

    async fn fetch_target(directory: &dyn DirectoryTarget) -> Result<Vec<Self>, DirectoryError> {
        directory.search_users().await
    }

    async fn create(
        &self,
        directory: &dyn DirectoryTarget,
        attrs: &TargetAttributes,
    ) -> Result<(), DirectoryError> {
        directory.create_user(&self.username, attrs).await
    }

    async fn modify(
        &self,
        directory: &dyn DirectoryTarget,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError> {
        directory.modify_user(&self.username, modifications).await
    }

    async fn delete(&self, directory: &dyn DirectoryTarget) -> Result<(), DirectoryError> {
        directory.delete_user(&self.username).await
    }
}

#[async_trait]
impl Reconcilable for GroupRecord {
    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot::from_group(self)
    }

    async fn fetch_source(source: &dyn IdentitySource) -> Result<Vec<Self>, SourceError> {
        source.list_groups().await
    }

    async fn fetch_target(directory: &dyn DirectoryTarget) -> Result<Vec<Self>, DirectoryError> {
        directory.search_groups().await
    }

    async fn create(
        &self,
        directory: &dyn DirectoryTarget,
        attrs: &TargetAttributes,
    ) -> Result<(), DirectoryError> {
        directory.create_group(&self.name, attrs, &self.members).await
    }

    async fn modify(
        &self,
        directory: &dyn DirectoryTarget,
        modifications: &[Modification],
    ) -> Result<(), DirectoryError> {
        directory.modify_group(&self.name, modifications).await
    }

    async fn delete(&self, directory: &dyn DirectoryTarget) -> Result<(), DirectoryError> {
        directory.delete_group(&self.name).await
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Drives reconciliation runs against one source, one directory and one
/// audit store.
pub struct Reconciler {
    config: AppConfig,
    source: Arc<dyn IdentitySource>,
    directory: Arc<dyn DirectoryTarget>,
    audit: Arc<dyn AuditRecorder>,
    user_mapper: AttributeMapper,
    group_mapper: AttributeMapper,
    /// Prevents overlapping runs.
    running: Arc<AtomicBool>,
    current_run_started: Mutex<Option<DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(
        config: AppConfig,
        source: Arc<dyn IdentitySource>,
        directory: Arc<dyn DirectoryTarget>,
        audit: Arc<dyn AuditRecorder>,
    ) -> Self {
        let user_mapper = AttributeMapper::for_users(config.mapping.user.clone());
        let group_mapper = AttributeMapper::for_groups(config.mapping.group.clone());
        info!(
            user_mappings = user_mapper.table().len(),
            group_mappings = group_mapper.table().len(),
            "initializing reconciler"
        );
        Self {
            config,
            source,
            directory,
            audit,
            user_mapper,
            group_mapper,
            running: Arc::new(AtomicBool::new(false)),
            current_run_started: Mutex::new(None),
        }
    }

    /// Build a reconciler over the IDCS source, the LDAP directory and the
    /// SQLite audit store named in `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, SyncError> {
        let source = IdcsSource::new(&config.source)?;
        let directory = LdapDirectory::new(config.directory.clone());
        let db = Database::new(&config.database.path)?;
        Ok(Self::new(
            config,
            Arc::new(source),
            Arc::new(directory),
            Arc::new(db),
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Options for a scheduled run: everything from config, all phases.
    pub fn default_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config.sync)
    }

    fn set_current_run(&self, started: Option<DateTime<Utc>>) {
        match self.current_run_started.lock() {
            Ok(mut guard) => *guard = started,
            Err(poisoned) => *poisoned.into_inner() = started,
        }
    }

    fn current_run(&self) -> Option<DateTime<Utc>> {
        match self.current_run_started.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one reconciliation run.
    ///
    /// Returns `Err` only when sync is disabled, INIT fails or another run
    /// is in progress. Per-entity and per-phase failures are reported
    /// through the outcome's status and error list.
    pub async fn run(&self, options: &RunOptions) -> Result<RunOutcome, SyncError> {
        self.config.ensure_enabled()?;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .current_run()
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(SyncError::AlreadyRunning { started_at });
        }
        let _guard = RunLockGuard(self.running.clone());

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let run_type = options.phases.run_type();
        self.set_current_run(Some(started_at));

        info!(
            run_id = %run_id,
            run_type = %run_type,
            dry_run = options.dry_run,
            "starting reconciliation"
        );

        if let Err(e) = self.initialize().await {
            error!(run_id = %run_id, error = %e, "initialization failed");
            let details = serde_json::json!({
                "error": e.to_string(),
                DETAILS_RUN_ID: run_id,
                DETAILS_DRY_RUN: options.dry_run,
            });
            if let Err(db_err) =
                self.audit
                    .record_run_status(run_type.as_str(), RunStatus::Error, &details)
            {
                warn!(error = %db_err, "failed to record initialization failure");
            }
            self.set_current_run(None);
            return Err(e);
        }

        let mut stats = SyncStats::new();
        let mut phase_failed = false;

        if options.phases.includes_users() {
            info!("starting user synchronization");
            if let Err(e) = self
                .run_phase::<IdentityRecord>(
                    &self.user_mapper,
                    options.delete_missing_users,
                    options.dry_run,
                    &mut stats,
                )
                .await
            {
                error!(error = %e, "user synchronization failed");
                stats.record_error(e.to_string());
                phase_failed = true;
            }
        }

        if options.phases.includes_groups() {
            info!("starting group synchronization");
            if let Err(e) = self
                .run_phase::<GroupRecord>(
                    &self.group_mapper,
                    options.delete_missing_groups,
                    options.dry_run,
                    &mut stats,
                )
                .await
            {
                error!(error = %e, "group synchronization failed");
                stats.record_error(e.to_string());
                phase_failed = true;
            }
        }

        self.sync_reverse_direction();

        let outcome = RunOutcome {
            run_id,
            run_type,
            status: overall_status(&stats, phase_failed),
            stats,
            dry_run: options.dry_run,
            started_at,
            completed_at: Utc::now(),
        };

        if let Err(e) =
            self.audit
                .record_run_status(run_type.as_str(), outcome.status, &outcome.details())
        {
            warn!(error = %e, "failed to record run status");
        }

        info!(
            run_id = %outcome.run_id,
            status = %outcome.status,
            users_processed = outcome.stats.users.processed,
            groups_processed = outcome.stats.groups.processed,
            errors = outcome.stats.errors.len(),
            "reconciliation complete"
        );

        self.set_current_run(None);
        Ok(outcome)
    }

    /// The directory never writes back to the identity provider.
    pub fn sync_reverse_direction(&self) {
        debug!("directory to identity provider sync skipped: identity provider is authoritative");
    }

    async fn initialize(&self) -> Result<(), SyncError> {
        self.audit.initialize().map_err(|e| SyncError::Init {
            stage: "audit store".into(),
            detail: e.to_string(),
        })?;
        self.source.initialize().await.map_err(|e| SyncError::Init {
            stage: "identity provider".into(),
            detail: e.to_string(),
        })?;
        self.directory.initialize().await.map_err(|e| SyncError::Init {
            stage: "directory".into(),
            detail: e.to_string(),
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn run_phase<R: Reconcilable>(
        &self,
        mapper: &AttributeMapper,
        delete_missing: bool,
        dry_run: bool,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let kind = R::KIND;
        let phase = format!("{kind}s");

        let mut source = R::fetch_source(self.source.as_ref())
            .await
            .map_err(|e| SyncError::PhaseFailed {
                phase: phase.clone(),
                detail: e.to_string(),
            })?;
        for record in &mut source {
            record.normalize(self.directory.as_ref());
        }
        info!(kind = %kind, count = source.len(), "retrieved records from identity provider");

        let target = R::fetch_target(self.directory.as_ref())
            .await
            .map_err(|e| SyncError::PhaseFailed {
                phase: phase.clone(),
                detail: e.to_string(),
            })?;
        info!(kind = %kind, count = target.len(), "retrieved records from directory");

        let plan = diff(&source, &target, delete_missing);
        stats.counters_mut(kind).processed += plan.examined() as u64;
        debug!(
            kind = %kind,
            examined = plan.examined(),
            deletes = plan.deletes.len(),
            "diff complete"
        );

        for step in &plan.steps {
            match step {
                SourceStep::Create(record) => {
                    self.apply_create(*record, mapper, dry_run, stats).await
                }
                SourceStep::Update(update) => {
                    self.apply_update(update.source, &update.modifications, dry_run, stats)
                        .await
                }
                SourceStep::Unchanged(record) => {
                    debug!(kind = %kind, key = record.join_key(), "no changes needed");
                    stats.counters_mut(kind).unchanged += 1;
                }
                SourceStep::Rejected(rejection) => reject(stats, kind, rejection),
            }
        }

        for rejection in &plan.rejected_deletes {
            reject(stats, kind, rejection);
        }
        for record in &plan.deletes {
            self.apply_delete(*record, dry_run, stats).await;
        }

        info!(kind = %kind, counters = ?stats.counters(kind), "{phase} synchronization completed");
        Ok(())
    }

    async fn apply_create<R: Reconcilable>(
        &self,
        record: &R,
        mapper: &AttributeMapper,
        dry_run: bool,
        stats: &mut SyncStats,
    ) {
        let kind = R::KIND;
        let key = record.join_key();
        if dry_run {
            info!(kind = %kind, key, "[DRY RUN] would create {kind}");
            stats.counters_mut(kind).created += 1;
            return;
        }
        let attrs = mapper.map(record);
        match record.create(self.directory.as_ref(), &attrs).await {
            Ok(()) => {
                stats.counters_mut(kind).created += 1;
                self.record_snapshot(record);
            }
            Err(e) => entity_failed(stats, kind, Action::Create, key, &e),
        }
    }

    async fn apply_update<R: Reconcilable>(
        &self,
        record: &R,
        modifications: &[Modification],
        dry_run: bool,
        stats: &mut SyncStats,
    ) {
        let kind = R::KIND;
        let key = record.join_key();
        if dry_run {
            info!(
                kind = %kind,
                key,
                changes = modifications.len(),
                "[DRY RUN] would update {kind}"
            );
            stats.counters_mut(kind).updated += 1;
            return;
        }
        match record.modify(self.directory.as_ref(), modifications).await {
            Ok(()) => {
                stats.counters_mut(kind).updated += 1;
                self.record_snapshot(record);
            }
            Err(e) => entity_failed(stats, kind, Action::Update, key, &e),
        }
    }

    async fn apply_delete<R: Reconcilable>(&self, record: &R, dry_run: bool, stats: &mut SyncStats) {
        let kind = R::KIND;
        let key = record.join_key();
        if dry_run {
            info!(kind = %kind, key, "[DRY RUN] would delete {kind}");
            stats.counters_mut(kind).deleted += 1;
            return;
        }
        match record.delete(self.directory.as_ref()).await {
            Ok(()) => {
                info!(kind = %kind, key, "deleted {kind} missing from identity provider");
                stats.counters_mut(kind).deleted += 1;
            }
            Err(e) => entity_failed(stats, kind, Action::Delete, key, &e),
        }
    }

    /// Best-effort snapshot write after a successful apply.
    fn record_snapshot<R: Reconcilable>(&self, record: &R) {
        if let Err(e) = self.audit.upsert_entity_snapshot(&record.snapshot()) {
            warn!(
                kind = %R::KIND,
                key = record.join_key(),
                error = %e,
                "failed to record entity snapshot"
            );
        }
    }
}

fn reject(stats: &mut SyncStats, kind: EntityKind, rejection: &Rejection) {
    let err = SyncError::DuplicateKey {
        kind: kind.to_string(),
        key: rejection.key.clone(),
        side: rejection.side.to_string(),
    };
    entity_failed(stats, kind, rejection.action, &rejection.key, &err);
}

fn entity_failed(
    stats: &mut SyncStats,
    kind: EntityKind,
    action: Action,
    key: &str,
    err: &dyn std::fmt::Display,
) {
    let message = format!("Failed to {action} {kind} {key}: {err}");
    error!("{message}");
    stats.counters_mut(kind).failed += 1;
    stats.record_error(message);
}

/// Clears the running flag on drop, including on panic.
struct RunLockGuard(Arc<AtomicBool>);

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
