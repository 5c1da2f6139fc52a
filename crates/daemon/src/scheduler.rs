//! Reconciliation scheduler: runs the reconciler on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use idsync_core::models::RunStatus;
use idsync_core::reconcile::{Reconciler, RunOptions};

/// Aggregate counters across runs.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_runs: AtomicU64,
    pub skipped_ticks: AtomicU64,
    /// Runs that ended in `partial_failure` or `error`, or failed to start.
    pub failed_runs: AtomicU64,
    pub consecutive_failures: AtomicU64,
}

impl SchedulerStats {
    fn record(&self, succeeded: bool) -> u64 {
        if succeeded {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            0
        } else {
            self.failed_runs.fetch_add(1, Ordering::SeqCst);
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
        }
    }
}

/// Runs a reconciliation every `interval`.
///
/// Each run executes in its own task. A tick that arrives while the previous
/// run is still going is skipped rather than queued.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    options: RunOptions,
    stats: Arc<SchedulerStats>,
    current: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration, options: RunOptions) -> Self {
        Self {
            reconciler,
            interval,
            options,
            stats: Arc::new(SchedulerStats::default()),
            current: None,
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main loop. The first run starts immediately. Returns after `shutdown`
    /// is notified and the in-flight run, if any, has finished.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            interval_secs = self.interval.as_secs(),
            dry_run = self.options.dry_run,
            "scheduler started"
        );

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maybe_start_run();
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }

        if let Some(handle) = self.current.take() {
            if !handle.is_finished() {
                info!("waiting for in-flight reconciliation to finish");
            }
            if let Err(e) = handle.await {
                warn!(error = %e, "reconciliation task ended abnormally");
            }
        }
    }

    /// Start a run unless one is already in progress.
    fn maybe_start_run(&mut self) {
        let busy = self.reconciler.is_running()
            || self.current.as_ref().is_some_and(|h| !h.is_finished());
        if busy {
            self.stats.skipped_ticks.fetch_add(1, Ordering::SeqCst);
            warn!("skipping scheduled run: previous run still in progress");
            return;
        }

        let run_num = self.stats.total_runs.fetch_add(1, Ordering::SeqCst) + 1;
        let reconciler = self.reconciler.clone();
        let options = self.options.clone();
        let stats = self.stats.clone();

        self.current = Some(tokio::spawn(async move {
            info!(run = run_num, "starting scheduled reconciliation");
            match reconciler.run(&options).await {
                Ok(outcome) => {
                    let consecutive = stats.record(outcome.status == RunStatus::Success);
                    if outcome.status == RunStatus::Success {
                        info!(
                            run = run_num,
                            run_id = %outcome.run_id,
                            users_created = outcome.stats.users.created,
                            users_updated = outcome.stats.users.updated,
                            users_deleted = outcome.stats.users.deleted,
                            groups_created = outcome.stats.groups.created,
                            groups_updated = outcome.stats.groups.updated,
                            groups_deleted = outcome.stats.groups.deleted,
                            "scheduled reconciliation succeeded"
                        );
                    } else {
                        warn!(
                            run = run_num,
                            run_id = %outcome.run_id,
                            status = %outcome.status,
                            errors = outcome.stats.errors.len(),
                            consecutive_failures = consecutive,
                            "scheduled reconciliation finished with errors"
                        );
                        for message in &outcome.stats.errors {
                            warn!(run = run_num, "{message}");
                        }
                    }
                }
                Err(e) => {
                    let consecutive = stats.record(false);
                    error!(
                        run = run_num,
                        error = %e,
                        consecutive_failures = consecutive,
                        "scheduled reconciliation failed"
                    );
                }
            }
        }));
    }
}
