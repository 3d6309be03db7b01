//! Makes an ingested chapter visible in the catalog.
//!
//! The existence re-check, chapter and page rows, the source's
//! `last_chapter_number_seen` max-merge and the Job completion share one
//! transaction, so readers see either the whole chapter or nothing.

use crate::catalog::Catalog;
use crate::db::{self, SharedConnection};
use crate::downloader::{page_file_name, StagedChapter};
use crate::error::{PipelineError, PipelineResult};
use crate::helpers::sanitize_filename;
use crate::models::{Job, Source};
use crate::queue;
use chrono::Utc;
use rusqlite::Connection;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Created { chapter_id: i64, pages: usize },
    /// The chapter appeared in the catalog by other means; nothing written.
    AlreadyExists,
    /// The Job was reclaimed and handed to another worker; nothing written.
    ClaimLost,
}

/// Library directory of a chapter. The number is written at full precision
/// so distinct chapters never share a directory.
pub fn chapter_dir(library_root: &Path, series_id: i64, chapter_number: f64) -> PathBuf {
    library_root
        .join(series_id.to_string())
        .join(sanitize_filename(&chapter_number.to_string()))
}

/// Complete a Job whose chapter already exists, without touching the catalog.
/// Returns `false` if the chapter does not exist.
pub fn complete_if_exists(
    conn: &mut Connection,
    catalog: &dyn Catalog,
    source: &Source,
    job: &Job,
) -> PipelineResult<bool> {
    let tx = conn.transaction()?;
    if !catalog.chapter_exists(&tx, source.series_id, job.chapter_number)? {
        return Ok(false);
    }
    db::advance_last_chapter_seen(&tx, source.id, job.chapter_number)?;
    if !queue::complete(&tx, job, Utc::now())? {
        log::warn!("Job {}: chapter exists but the claim was lost, leaving the job to its new owner", job.id);
    }
    tx.commit()?;
    log::info!(
        "Job {}: chapter {} of series {} already exists, marked completed",
        job.id,
        job.chapter_number,
        source.series_id
    );
    Ok(true)
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // staging and library on different filesystems
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

/// Synchronous publish against an open connection.
pub fn publish_staged(
    conn: &mut Connection,
    catalog: &dyn Catalog,
    library_root: &Path,
    source: &Source,
    job: &Job,
    staged: &StagedChapter,
) -> PipelineResult<PublishOutcome> {
    if complete_if_exists(conn, catalog, source, job)? {
        return Ok(PublishOutcome::AlreadyExists);
    }
    if !queue::holds_claim(conn, job)? {
        log::warn!("Job {}: claim lost before publishing, discarding staged pages", job.id);
        return Ok(PublishOutcome::ClaimLost);
    }
    if staged.images.is_empty() {
        return Err(PipelineError::Config(format!("job {} has no staged pages", job.id)));
    }

    let dir = chapter_dir(library_root, source.series_id, job.chapter_number);
    if dir.exists() {
        // leftover from an attempt that never committed
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    let result = write_chapter(conn, catalog, &dir, source, job, staged);
    if result.is_err() {
        if let Err(e) = fs::remove_dir_all(&dir) {
            log::warn!("Could not remove {}: {}", dir.display(), e);
        }
    }
    result
}

fn write_chapter(
    conn: &mut Connection,
    catalog: &dyn Catalog,
    dir: &Path,
    source: &Source,
    job: &Job,
    staged: &StagedChapter,
) -> PipelineResult<PublishOutcome> {
    let mut pages = Vec::with_capacity(staged.images.len());
    for (i, image) in staged.images.iter().enumerate() {
        let dest = dir.join(page_file_name(i + 1));
        move_file(&image.local_path, &dest)?;
        pages.push(dest);
    }

    let tx = conn.transaction()?;
    // authoritative check: a manual upload may have landed since the first one
    if catalog.chapter_exists(&tx, source.series_id, job.chapter_number)? {
        drop(tx);
        complete_if_exists(conn, catalog, source, job)?;
        fs::remove_dir_all(dir)?;
        return Ok(PublishOutcome::AlreadyExists);
    }

    let locked = !source.auto_publish;
    let chapter_id = catalog.create_chapter(
        &tx,
        source.series_id,
        job.chapter_number,
        &job.display_title(),
        locked,
    )?;
    catalog.create_pages(&tx, chapter_id, &pages)?;
    db::advance_last_chapter_seen(&tx, source.id, job.chapter_number)?;
    if !queue::complete(&tx, job, Utc::now())? {
        drop(tx);
        log::warn!("Job {}: claim lost during publish, rolled back", job.id);
        fs::remove_dir_all(dir)?;
        return Ok(PublishOutcome::ClaimLost);
    }
    tx.commit()?;

    log::info!(
        "Job {}: published chapter {} of series {} with {} pages{}",
        job.id,
        job.chapter_number,
        source.series_id,
        pages.len(),
        if locked { " (locked)" } else { "" }
    );
    Ok(PublishOutcome::Created {
        chapter_id,
        pages: pages.len(),
    })
}

/// Publish on the blocking pool, then drop the staging directory whatever
/// the outcome.
pub async fn publish(
    db: SharedConnection,
    catalog: Arc<dyn Catalog>,
    library_root: PathBuf,
    source: Source,
    job: Job,
    staged: StagedChapter,
) -> PipelineResult<PublishOutcome> {
    let staging_dir = staged.dir.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut conn = db::lock(&db);
        publish_staged(&mut conn, catalog.as_ref(), &library_root, &source, &job, &staged)
    })
    .await
    .map_err(|e| PipelineError::Io(io::Error::other(e)))?;

    crate::downloader::remove_staging_dir(&staging_dir).await;
    result
}
