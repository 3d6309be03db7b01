use crate::activity::{self, NewActivity};
use crate::app_state::AppState;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::track_request;
use crate::models::{ActivityOutcome, ChapterDescriptor, DiscoveryEvent, Source};
use crate::queue;
use crate::settings::PipelineSettings;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, timeout};

/// Outcome of checking one Source.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub source_id: i64,
    pub outcome: ActivityOutcome,
    /// Chapters newer than the source's high-water mark
    pub new_chapters: usize,
    /// Rows actually inserted; lower than `new_chapters` when some were queued already
    pub enqueued: usize,
    pub error: Option<String>,
}

/// Chapters strictly newer than `last_seen`, in listing order.
pub fn select_new(chapters: Vec<ChapterDescriptor>, last_seen: f64) -> Vec<ChapterDescriptor> {
    chapters.into_iter().filter(|c| c.number > last_seen).collect()
}

/// Higher priority for sources that publish without review.
pub fn priority_for(source: &Source) -> i64 {
    if source.auto_publish {
        1
    } else {
        0
    }
}

async fn list_source_chapters(
    state: &AppState,
    source: &Source,
    settings: &PipelineSettings,
) -> PipelineResult<Vec<ChapterDescriptor>> {
    let family = source.family().map_err(PipelineError::Config)?;
    let adapter = state
        .adapters
        .adapter(family)
        .ok_or_else(|| PipelineError::Config(format!("no adapter for site family {}", family)))?;

    track_request(&state.metrics, family.as_str(), async {
        match timeout(settings.adapter_timeout, adapter.list_chapters(&source.listing_url)).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::Timeout(settings.adapter_timeout.as_secs())),
        }
    })
    .await
}

fn enqueue_all(state: &AppState, source: &Source, chapters: &[ChapterDescriptor], settings: &PipelineSettings) -> usize {
    let conn = db::lock(&state.db);
    let priority = priority_for(source);
    let mut enqueued = 0;
    for chapter in chapters {
        match queue::enqueue(&conn, source.id, chapter, priority, settings.job_max_attempts) {
            Ok(true) => enqueued += 1,
            Ok(false) => {}
            Err(e) => log::error!(
                "Failed to enqueue chapter {} of source {}: {}",
                chapter.number,
                source.id,
                e
            ),
        }
    }
    enqueued
}

/// Check one Source: list chapters, enqueue the new ones, then record the
/// attempt in the Activity Log and stamp `last_checked_at`.
pub async fn check_source(state: &AppState, source: &Source, settings: &PipelineSettings) -> CheckReport {
    let started = Instant::now();
    log::info!(
        "Checking source {} ({} / series {}): {}",
        source.id,
        source.site_family,
        source.series_id,
        source.listing_url
    );

    let (outcome, new_chapters, enqueued, error) = match list_source_chapters(state, source, settings).await {
        Ok(chapters) => {
            let listed = chapters.len();
            let new = select_new(chapters, source.last_chapter_number_seen);
            let enqueued = enqueue_all(state, source, &new, settings);
            log::info!(
                "Source {}: {} chapters listed, {} new, {} enqueued",
                source.id,
                listed,
                new.len(),
                enqueued
            );
            let outcome = if new.is_empty() {
                ActivityOutcome::NoNewChapters
            } else {
                ActivityOutcome::Success
            };
            (outcome, new.len(), enqueued, None)
        }
        Err(e) => {
            if e.is_transient() {
                log::warn!("Source {} check failed: {}", source.id, e)
            } else {
                log::error!("Source {} check failed: {}", source.id, e)
            }
            (ActivityOutcome::Failed, 0, 0, Some(e.to_string()))
        }
    };

    let now = Utc::now();
    {
        let conn = db::lock(&state.db);
        let entry = NewActivity {
            source_id: source.id,
            checked_at: now,
            outcome,
            chapters_found: new_chapters,
            execution_time_ms: started.elapsed().as_millis(),
            error_message: error.as_deref(),
        };
        if let Err(e) = activity::append(&conn, &entry) {
            log::error!("Failed to write activity entry for source {}: {}", source.id, e);
        }
        if let Err(e) = db::mark_checked(&conn, source.id, now) {
            log::error!("Failed to mark source {} checked: {}", source.id, e);
        }
    }

    if enqueued > 0 && source.notify_on_discovery {
        let event = DiscoveryEvent {
            source_id: source.id,
            series_id: source.series_id,
            chapters_found: enqueued,
        };
        // no subscribers is fine
        let _ = state.events.send(event);
    }

    CheckReport {
        source_id: source.id,
        outcome,
        new_chapters,
        enqueued,
        error,
    }
}

/// One scheduling pass over every due Source, one at a time. Returns a
/// report per checked Source; nothing when scraping is disabled.
pub async fn tick(state: &AppState) -> Vec<CheckReport> {
    let settings = state.settings.snapshot();
    if !settings.scraping_enabled {
        log::debug!("Scraping disabled, skipping discovery tick");
        return Vec::new();
    }
    state.client.set_request_timeout(settings.request_timeout);

    let due = {
        let conn = db::lock(&state.db);
        db::due_sources(&conn, Utc::now())
    };
    let due = match due {
        Ok(sources) => sources,
        Err(e) => {
            log::error!("Failed to load due sources: {}", e);
            return Vec::new();
        }
    };
    if !due.is_empty() {
        log::info!("{} source(s) due for a check", due.len());
    }

    let mut reports = Vec::with_capacity(due.len());
    for source in &due {
        reports.push(check_source(state, source, &settings).await);
    }
    reports
}

/// Scheduler loop. Runs until the task is aborted.
pub async fn run(state: Arc<AppState>) {
    log::info!("Discovery scheduler started");
    loop {
        tick(&state).await;
        let interval = state.settings.snapshot().scan_interval;
        sleep(interval).await;
    }
}

/// Log every discovery notification until all senders are gone. Returns the
/// number of notifications seen. A slow reader skips what it missed.
pub async fn log_discoveries(mut events: broadcast::Receiver<DiscoveryEvent>) -> usize {
    let mut seen = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                seen += 1;
                log::info!(
                    "New chapters for series {}: {} queued from source {}",
                    event.series_id,
                    event.chapters_found,
                    event.source_id
                );
            }
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Discovery notifier fell behind, {} notification(s) skipped", missed);
            }
            Err(RecvError::Closed) => return seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(number: f64) -> ChapterDescriptor {
        ChapterDescriptor {
            number,
            title: None,
            url: format!("https://site.example/c/{}", number),
        }
    }

    #[test]
    fn only_chapters_above_high_water_mark() {
        let listed = vec![chapter(1.0), chapter(2.0), chapter(2.5), chapter(3.0)];
        let new: Vec<f64> = select_new(listed, 2.0).into_iter().map(|c| c.number).collect();
        assert_eq!(new, vec![2.5, 3.0]);
    }

    #[test]
    fn fresh_source_takes_everything() {
        let listed = vec![chapter(0.5), chapter(1.0)];
        assert_eq!(select_new(listed, 0.0).len(), 2);
    }

    #[tokio::test]
    async fn notifier_keeps_going_after_falling_behind() {
        let (tx, rx) = broadcast::channel(2);
        for source_id in 1..=5 {
            tx.send(DiscoveryEvent {
                source_id,
                series_id: 9,
                chapters_found: 1,
            })
            .unwrap();
        }
        drop(tx);
        // the three oldest were overwritten, the two newest are still delivered
        assert_eq!(log_discoveries(rx).await, 2);
    }
}
