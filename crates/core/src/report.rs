//! Fixed-format end-of-run report.

use std::fmt::Write;

use crate::models::EntityCounters;
use crate::reconcile::RunOutcome;

const RULE_WIDTH: usize = 50;

/// Render the plain-text report printed after every run.
pub fn render_report(outcome: &RunOutcome) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "           SYNCHRONIZATION REPORT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Timestamp: {}", outcome.completed_at.to_rfc3339());
    let _ = writeln!(
        out,
        "Mode: {}",
        if outcome.dry_run { "DRY RUN" } else { "LIVE" }
    );
    let _ = writeln!(out);
    write_counters(&mut out, "USERS", &outcome.stats.users);
    let _ = writeln!(out);
    write_counters(&mut out, "GROUPS", &outcome.stats.groups);
    let _ = writeln!(out);
    let _ = writeln!(out, "ERRORS: {}", outcome.stats.errors.len());
    for error in &outcome.stats.errors {
        let _ = writeln!(out, "  - {error}");
    }
    let _ = writeln!(out, "{rule}");
    out
}

fn write_counters(out: &mut String, title: &str, counters: &EntityCounters) {
    let _ = writeln!(out, "{title}:");
    let _ = writeln!(out, "  Processed: {}", counters.processed);
    let _ = writeln!(out, "  Created:   {}", counters.created);
    let _ = writeln!(out, "  Updated:   {}", counters.updated);
    let _ = writeln!(out, "  Deleted:   {}", counters.deleted);
}
