use crate::activity;
use crate::app_state::AppState;
use crate::db;
use crate::queue;
use crate::settings::PipelineSettings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed_jobs: usize,
    pub purged_activity: usize,
    pub purged_jobs: usize,
}

/// `now` minus a retention window in days, or `None` when the window reaches
/// past the representable range and nothing can be old enough.
fn days_before(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    ChronoDuration::try_days(days).and_then(|d| now.checked_sub_signed(d))
}

fn elapsed_before(now: DateTime<Utc>, after: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}

/// Return stale `processing` Jobs to `pending` and drop old history.
pub fn sweep(state: &AppState, settings: &PipelineSettings, now: DateTime<Utc>) -> rusqlite::Result<SweepReport> {
    let conn = db::lock(&state.db);
    let mut report = SweepReport::default();

    match elapsed_before(now, settings.stale_job_after) {
        Some(cutoff) => report.reclaimed_jobs = queue::reclaim_stale(&conn, cutoff)?,
        None => log::debug!("Stale job threshold out of range, nothing reclaimed"),
    }
    match days_before(now, settings.log_retention_days) {
        Some(cutoff) => report.purged_activity = activity::purge_older_than(&conn, cutoff)?,
        None => log::debug!("Activity retention out of range, nothing purged"),
    }
    match days_before(now, settings.job_retention_days) {
        Some(cutoff) => report.purged_jobs = queue::purge_terminal_older_than(&conn, cutoff)?,
        None => log::debug!("Job retention out of range, nothing purged"),
    }

    Ok(report)
}

/// Maintenance loop. The first sweep runs immediately so Jobs orphaned by a
/// crash are picked up again at start-up.
pub async fn run(state: Arc<AppState>) {
    log::info!("Maintenance task started");
    loop {
        let settings = state.settings.snapshot();
        match sweep(&state, &settings, Utc::now()) {
            Ok(report) if report != SweepReport::default() => log::info!(
                "Maintenance: {} stale job(s) reclaimed, {} activity entries and {} jobs purged",
                report.reclaimed_jobs,
                report.purged_activity,
                report.purged_jobs
            ),
            Ok(_) => {}
            Err(e) => log::error!("Maintenance sweep failed: {}", e),
        }
        state.metrics.log_summary();
        sleep(settings.cleanup_interval).await;
    }
}
