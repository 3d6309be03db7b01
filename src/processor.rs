//! Queue Processor: a bounded worker pool draining the Work Queue.
//!
//! Every error raised while handling a Job stops at `handle_job` and becomes
//! a queue transition. Nothing propagates out of the pool.

use crate::activity::{self, NewActivity};
use crate::app_state::AppState;
use crate::db;
use crate::downloader::{self, DownloadOptions};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::track_request;
use crate::models::{ActivityOutcome, Job, JobStatus, Source};
use crate::publisher::{self, PublishOutcome};
use crate::queue;
use crate::settings::PipelineSettings;
use crate::sources::ExtractOptions;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

/// What happened to one claimed Job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Published { pages: usize },
    AlreadyExisted,
    /// Failed attempt; `status` is where the Job went (`pending` or `failed`).
    Failed { status: JobStatus, error: String },
    /// The Job was reclaimed while this worker held it; its result was dropped.
    ClaimLost,
}

fn load_source(state: &AppState, source_id: i64) -> PipelineResult<Source> {
    let conn = db::lock(&state.db);
    db::get_source(&conn, source_id)?
        .ok_or_else(|| PipelineError::Config(format!("source {} no longer exists", source_id)))
}

/// Run one Job to completion or to a failed attempt.
async fn run_job(state: &AppState, job: &Job, settings: &PipelineSettings) -> PipelineResult<PublishOutcome> {
    let source = load_source(state, job.source_id)?;
    let family = source.family().map_err(PipelineError::Config)?;
    let adapter = state
        .adapters
        .adapter(family)
        .ok_or_else(|| PipelineError::Config(format!("no adapter for site family {}", family)))?;

    // cheap pre-check; the publisher repeats it inside its transaction
    {
        let mut conn = db::lock(&state.db);
        if publisher::complete_if_exists(&mut conn, state.catalog.as_ref(), &source, job)? {
            return Ok(PublishOutcome::AlreadyExists);
        }
    }

    let options = ExtractOptions {
        decorative_filter: settings.decorative_filter_enabled,
        min_page_count: settings.min_page_count,
    };
    let listing = track_request(&state.metrics, family.as_str(), async {
        match timeout(settings.adapter_timeout, adapter.list_pages(&job.chapter_url, &options)).await {
            Ok(result) => result.map_err(PipelineError::from),
            Err(_) => Err(PipelineError::Timeout(settings.adapter_timeout.as_secs())),
        }
    })
    .await?;
    log::info!(
        "Job {}: {} pages listed for chapter {} of source {}",
        job.id,
        listing.len(),
        job.chapter_number,
        source.id
    );

    let staged = downloader::download_chapter(
        state.fetcher.as_ref(),
        job.id,
        &listing,
        &job.chapter_url,
        &state.config.staging_path(),
        &DownloadOptions::from(settings),
    )
    .await?;

    publisher::publish(
        state.db.clone(),
        state.catalog.clone(),
        state.config.library_path(),
        source,
        job.clone(),
        staged,
    )
    .await
}

/// Process a claimed Job and apply the resulting state transition.
pub async fn handle_job(state: &AppState, job: Job, settings: &PipelineSettings) -> JobOutcome {
    let started = Instant::now();
    log::info!(
        "Job {}: processing chapter {} of source {} (attempt {}/{})",
        job.id,
        job.chapter_number,
        job.source_id,
        job.attempts + 1,
        job.max_attempts
    );

    match run_job(state, &job, settings).await {
        Ok(PublishOutcome::Created { pages, .. }) => {
            log::info!("Job {}: completed in {}ms", job.id, started.elapsed().as_millis());
            JobOutcome::Published { pages }
        }
        Ok(PublishOutcome::AlreadyExists) => JobOutcome::AlreadyExisted,
        Ok(PublishOutcome::ClaimLost) => JobOutcome::ClaimLost,
        Err(e) => {
            let error = e.to_string();
            let now = Utc::now();
            let conn = db::lock(&state.db);
            let status = match queue::record_failure(&conn, &job, &error, e.is_retryable(), now) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    log::warn!("Job {}: claim lost, dropping failure: {}", job.id, error);
                    return JobOutcome::ClaimLost;
                }
                Err(db_err) => {
                    log::error!("Job {}: could not record failure ({}): {}", job.id, db_err, error);
                    JobStatus::Processing
                }
            };

            if status.is_terminal() {
                log::error!("Job {}: failed permanently: {}", job.id, error);
                let message = format!("job {} ({}) failed: {}", job.id, job.display_title(), error);
                let entry = NewActivity {
                    source_id: job.source_id,
                    checked_at: now,
                    outcome: ActivityOutcome::Failed,
                    chapters_found: 0,
                    execution_time_ms: started.elapsed().as_millis(),
                    error_message: Some(&message),
                };
                if let Err(log_err) = activity::append(&conn, &entry) {
                    log::error!("Failed to write activity entry for job {}: {}", job.id, log_err);
                }
            } else {
                log::warn!("Job {}: attempt failed, back to {}: {}", job.id, status, error);
            }
            JobOutcome::Failed { status, error }
        }
    }
}

/// Claim and process Jobs with at most `max_concurrent_downloads` in flight
/// until the queue is empty. Returns the number of Jobs handled.
pub async fn drain_queue(state: &Arc<AppState>, settings: &PipelineSettings) -> usize {
    let mut workers = JoinSet::new();
    let mut handled = 0usize;
    let mut exhausted = false;

    loop {
        while !exhausted && workers.len() < settings.max_concurrent_downloads {
            let claimed = {
                let mut conn = db::lock(&state.db);
                queue::claim_next(&mut conn, Utc::now())
            };
            match claimed {
                Ok(Some(job)) => {
                    let state = state.clone();
                    let settings = settings.clone();
                    workers.spawn(async move { handle_job(&state, job, &settings).await });
                }
                Ok(None) => exhausted = true,
                Err(e) => {
                    log::error!("Failed to claim next job: {}", e);
                    exhausted = true;
                }
            }
        }

        match workers.join_next().await {
            Some(Ok(_)) => handled += 1,
            Some(Err(e)) => {
                // a panicked worker leaves its Job in processing for stale reclaim
                log::error!("Queue worker panicked: {}", e);
                handled += 1;
            }
            None => break,
        }
    }
    handled
}

/// Processor loop. Runs until the task is aborted.
pub async fn run(state: Arc<AppState>) {
    log::info!("Queue processor started");
    loop {
        let settings = state.settings.snapshot();
        state.client.set_request_timeout(settings.request_timeout);

        if !settings.scraping_enabled {
            log::debug!("Scraping disabled, processor idle");
            sleep(settings.queue_poll_interval).await;
            continue;
        }

        let handled = drain_queue(&state, &settings).await;
        if handled > 0 {
            log::info!("Processor handled {} job(s)", handled);
        } else {
            sleep(settings.queue_poll_interval).await;
        }
    }
}
