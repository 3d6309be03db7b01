//! Durable Work Queue and the Job state machine.
//!
//! ```text
//! pending -> processing -> completed
//!                       -> pending   (failure, attempts < max_attempts)
//!                       -> failed    (failure, attempts >= max_attempts or non-retryable)
//! ```
//!
//! Each claim stamps a fresh `claim_token`. Every transition out of
//! `processing` is an UPDATE guarded by that token, so a worker whose Job was
//! reclaimed as stale and handed to another worker can no longer move it.

use crate::helpers::{from_opt_timestamp, from_timestamp, to_timestamp};
use crate::models::{ChapterDescriptor, Job, JobStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use serde::Serialize;
use uuid::Uuid;

/// Status a processing Job moves to after a failed attempt. `attempts` is
/// the count including the attempt that just failed.
pub fn status_after_failure(attempts: i64, max_attempts: i64, retryable: bool) -> JobStatus {
    if !retryable || attempts >= max_attempts {
        JobStatus::Failed
    } else {
        JobStatus::Pending
    }
}

const JOB_COLUMNS: &str = "id, source_id, chapter_number, chapter_url, chapter_title, priority, \
     status, attempts, max_attempts, error_message, created_at, started_at, claim_token, processed_at";

fn job_from_row(row: &Row<'_>) -> Result<Job> {
    let status: String = row.get(6)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, e.into()))?;
    Ok(Job {
        id: row.get(0)?,
        source_id: row.get(1)?,
        chapter_number: row.get(2)?,
        chapter_url: row.get(3)?,
        chapter_title: row.get(4)?,
        priority: row.get(5)?,
        status,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        error_message: row.get(9)?,
        created_at: from_timestamp(row.get(10)?),
        started_at: from_opt_timestamp(row.get(11)?),
        claim_token: row.get(12)?,
        processed_at: from_opt_timestamp(row.get(13)?),
    })
}

/// Insert a pending Job unless one already exists for (source, chapter).
/// Returns `true` when a row was created.
pub fn enqueue(
    conn: &Connection,
    source_id: i64,
    chapter: &ChapterDescriptor,
    priority: i64,
    max_attempts: i64,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO jobs (source_id, chapter_number, chapter_url, chapter_title,
                                     priority, status, attempts, max_attempts, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7)",
        params![
            source_id,
            chapter.number,
            chapter.url,
            chapter.title,
            priority,
            max_attempts.max(1),
            to_timestamp(Utc::now()),
        ],
    )?;
    if inserted > 0 {
        log::info!(
            "Queued chapter {} of source {} (priority {})",
            chapter.number,
            source_id,
            priority
        );
    } else {
        log::debug!(
            "Chapter {} of source {} already queued, skipping",
            chapter.number,
            source_id
        );
    }
    Ok(inserted > 0)
}

/// Claim the highest-priority, oldest pending Job and mark it `processing`
/// under a new claim token.
pub fn claim_next(conn: &mut Connection, now: DateTime<Utc>) -> Result<Option<Job>> {
    let tx = conn.transaction()?;
    let candidate: Option<i64> = tx
        .query_row(
            "SELECT id FROM jobs WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let Some(id) = candidate else {
        return Ok(None);
    };

    let token = Uuid::new_v4().to_string();
    let claimed = tx.execute(
        "UPDATE jobs SET status = 'processing', started_at = ?1, claim_token = ?2
         WHERE id = ?3 AND status = 'pending'",
        params![to_timestamp(now), token, id],
    )?;
    if claimed == 0 {
        return Ok(None);
    }
    let job = tx.query_row(
        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
        params![id],
        job_from_row,
    )?;
    tx.commit()?;
    Ok(Some(job))
}

/// Mark the claimed Job completed. Returns `false` if `job` no longer holds
/// the claim.
pub fn complete(conn: &Connection, job: &Job, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'completed', processed_at = ?1, error_message = NULL,
                         claim_token = NULL
         WHERE id = ?2 AND status = 'processing' AND claim_token = ?3",
        params![to_timestamp(now), job.id, job.claim()],
    )?;
    Ok(changed > 0)
}

/// Record a failed attempt and move the Job to `pending` or `failed`.
/// Returns the new status, or `None` if `job` no longer holds the claim.
pub fn record_failure(
    conn: &Connection,
    job: &Job,
    error: &str,
    retryable: bool,
    now: DateTime<Utc>,
) -> Result<Option<JobStatus>> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT attempts, max_attempts FROM jobs
             WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![job.id, job.claim()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((attempts, max_attempts)) = row else {
        return Ok(None);
    };

    let attempts = (attempts + 1).min(max_attempts);
    let next = status_after_failure(attempts, max_attempts, retryable);
    let changed = conn.execute(
        "UPDATE jobs SET status = ?1, attempts = ?2, error_message = ?3, processed_at = ?4,
                         started_at = NULL, claim_token = NULL
         WHERE id = ?5 AND status = 'processing' AND claim_token = ?6",
        params![next.as_str(), attempts, error, to_timestamp(now), job.id, job.claim()],
    )?;
    Ok((changed > 0).then_some(next))
}

/// Whether `job` still holds its claim.
pub fn holds_claim(conn: &Connection, job: &Job) -> Result<bool> {
    let held: Option<i64> = conn
        .query_row(
            "SELECT id FROM jobs WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![job.id, job.claim()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(held.is_some())
}

pub fn get_job(conn: &Connection, job_id: i64) -> Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()
}

pub fn find_job(conn: &Connection, source_id: i64, chapter_number: f64) -> Result<Option<Job>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM jobs WHERE source_id = ?1 AND chapter_number = ?2",
            JOB_COLUMNS
        ),
        params![source_id, chapter_number],
        job_from_row,
    )
    .optional()
}

pub fn list_jobs_for_source(conn: &Connection, source_id: i64) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM jobs WHERE source_id = ?1 ORDER BY chapter_number",
        JOB_COLUMNS
    ))?;
    let rows = stmt.query_map(params![source_id], job_from_row)?;
    rows.collect()
}

/// Operator view: Jobs in one status, newest first.
pub fn list_by_status(conn: &Connection, status: JobStatus, limit: usize) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        JOB_COLUMNS
    ))?;
    let rows = stmt.query_map(params![status.as_str(), limit as i64], job_from_row)?;
    rows.collect()
}

/// Delete a Job that has not been claimed yet.
pub fn cancel_pending(conn: &Connection, job_id: i64) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM jobs WHERE id = ?1 AND status = 'pending'",
        params![job_id],
    )?;
    if changed > 0 {
        log::info!("Cancelled pending job {}", job_id);
    }
    Ok(changed > 0)
}

/// Replace a failed Job with a fresh pending one for the same chapter.
/// The failed row is removed, never revived. Returns the new Job id.
pub fn retry_failed(conn: &mut Connection, job_id: i64) -> Result<Option<i64>> {
    let tx = conn.transaction()?;
    let failed = tx
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1 AND status = 'failed'", JOB_COLUMNS),
            params![job_id],
            job_from_row,
        )
        .optional()?;
    let Some(failed) = failed else {
        return Ok(None);
    };

    tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
    tx.execute(
        "INSERT INTO jobs (source_id, chapter_number, chapter_url, chapter_title,
                           priority, status, attempts, max_attempts, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7)",
        params![
            failed.source_id,
            failed.chapter_number,
            failed.chapter_url,
            failed.chapter_title,
            failed.priority,
            failed.max_attempts,
            to_timestamp(Utc::now()),
        ],
    )?;
    let new_id = tx.last_insert_rowid();
    tx.commit()?;
    log::info!("Failed job {} re-queued as job {}", job_id, new_id);
    Ok(Some(new_id))
}

/// Return Jobs stuck in `processing` since before `cutoff` to `pending`.
/// Attempts are left unchanged; the worker never reported an outcome. The
/// claim token is dropped so that worker's late outcome is ignored.
pub fn reclaim_stale(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'pending', started_at = NULL, claim_token = NULL
         WHERE status = 'processing' AND (started_at IS NULL OR started_at < ?1)",
        params![to_timestamp(cutoff)],
    )?;
    if changed > 0 {
        log::warn!("Reclaimed {} stale processing job(s)", changed);
    }
    Ok(changed)
}

/// Purge terminal Jobs processed before `cutoff`. Pending Jobs are never aged out.
pub fn purge_terminal_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND processed_at < ?1",
        params![to_timestamp(cutoff)],
    )
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

pub fn stats(conn: &Connection) -> Result<QueueStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut stats = QueueStats::default();
    for row in rows {
        let (status, count) = row?;
        match status.parse::<JobStatus>() {
            Ok(JobStatus::Pending) => stats.pending = count,
            Ok(JobStatus::Processing) => stats.processing = count,
            Ok(JobStatus::Completed) => stats.completed = count,
            Ok(JobStatus::Failed) => stats.failed = count,
            Err(e) => log::warn!("Ignoring jobs with {}", e),
        }
    }
    Ok(stats)
}
