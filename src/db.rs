//! SQLite schema and the Source Registry.
//!
//! All pipeline state lives in one database so a crash or restart only loses
//! in-flight network work, never queue state.

use crate::helpers::{from_opt_timestamp, to_timestamp};
use crate::models::{NewSource, Source};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedConnection = Arc<Mutex<Connection>>;

pub fn init_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub fn init_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Lock the shared connection. A poisoned lock only means another task
/// panicked mid-call; SQLite itself rolled back any open transaction.
pub fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn create_tables(conn: &Connection) -> Result<()> {
    log::info!("Creating tables if not exists...");

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_id INTEGER NOT NULL,
            site_family TEXT NOT NULL,
            listing_url TEXT NOT NULL,
            check_interval_secs INTEGER NOT NULL DEFAULT 3600,
            last_checked_at INTEGER,
            last_chapter_number_seen REAL NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            auto_publish INTEGER NOT NULL DEFAULT 0,
            notify_on_discovery INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            UNIQUE(series_id, listing_url)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            chapter_number REAL NOT NULL,
            chapter_url TEXT NOT NULL,
            chapter_title TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            claim_token TEXT,
            processed_at INTEGER,
            FOREIGN KEY (source_id) REFERENCES sources (id) ON DELETE CASCADE,
            UNIQUE(source_id, chapter_number)
        );

        CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL,
            checked_at INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            chapters_found INTEGER NOT NULL DEFAULT 0,
            execution_time_ms INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            FOREIGN KEY (source_id) REFERENCES sources (id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            description TEXT,
            updated_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS catalog_chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            series_id INTEGER NOT NULL,
            number REAL NOT NULL,
            title TEXT NOT NULL,
            locked INTEGER NOT NULL DEFAULT 0,
            page_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(series_id, number)
        );

        CREATE TABLE IF NOT EXISTS catalog_pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chapter_id INTEGER NOT NULL,
            page_number INTEGER NOT NULL,
            image_path TEXT NOT NULL,
            FOREIGN KEY (chapter_id) REFERENCES catalog_chapters (id) ON DELETE CASCADE,
            UNIQUE(chapter_id, page_number)
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority DESC, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_activity_source ON activity_log(source_id, checked_at);",
    )?;

    // Migrations for databases created before these columns existed
    ensure_column(conn, "jobs", "started_at", "INTEGER")?;
    ensure_column(conn, "jobs", "claim_token", "TEXT")?;
    ensure_column(conn, "sources", "notify_on_discovery", "INTEGER NOT NULL DEFAULT 1")?;

    log::info!("Tables ensured.");
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, column_type: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(());
        }
    }
    log::info!("Adding column {}.{}", table, column);
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type),
        [],
    )?;
    Ok(())
}

const SOURCE_COLUMNS: &str = "id, series_id, site_family, listing_url, check_interval_secs, \
     last_checked_at, last_chapter_number_seen, is_active, auto_publish, notify_on_discovery";

fn source_from_row(row: &Row<'_>) -> Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        series_id: row.get(1)?,
        site_family: row.get(2)?,
        listing_url: row.get(3)?,
        check_interval_secs: row.get(4)?,
        last_checked_at: from_opt_timestamp(row.get(5)?),
        last_chapter_number_seen: row.get(6)?,
        is_active: row.get(7)?,
        auto_publish: row.get(8)?,
        notify_on_discovery: row.get(9)?,
    })
}

pub fn insert_source(conn: &Connection, new: &NewSource) -> Result<i64> {
    conn.execute(
        "INSERT INTO sources (series_id, site_family, listing_url, check_interval_secs,
                              auto_publish, notify_on_discovery, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new.series_id,
            new.site_family.as_str(),
            new.listing_url,
            new.check_interval_secs.max(1),
            new.auto_publish,
            new.notify_on_discovery,
            to_timestamp(Utc::now()),
        ],
    )?;
    let id = conn.last_insert_rowid();
    log::info!(
        "Registered source {} ({} {}) for series {}",
        id,
        new.site_family,
        new.listing_url,
        new.series_id
    );
    Ok(id)
}

pub fn get_source(conn: &Connection, id: i64) -> Result<Option<Source>> {
    conn.query_row(
        &format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS),
        params![id],
        source_from_row,
    )
    .optional()
}

pub fn list_sources(conn: &Connection) -> Result<Vec<Source>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM sources ORDER BY id", SOURCE_COLUMNS))?;
    let rows = stmt.query_map([], source_from_row)?;
    rows.collect()
}

/// Active sources whose check interval has elapsed.
pub fn due_sources(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Source>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sources
         WHERE is_active = 1
           AND (last_checked_at IS NULL OR ?1 - last_checked_at >= check_interval_secs)
         ORDER BY COALESCE(last_checked_at, 0), id",
        SOURCE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![to_timestamp(now)], source_from_row)?;
    rows.collect()
}

pub fn mark_checked(conn: &Connection, source_id: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE sources SET last_checked_at = ?1 WHERE id = ?2",
        params![to_timestamp(now), source_id],
    )?;
    Ok(())
}

/// Max-merge so out-of-order completions can never move the marker backwards.
pub fn advance_last_chapter_seen(conn: &Connection, source_id: i64, number: f64) -> Result<()> {
    conn.execute(
        "UPDATE sources SET last_chapter_number_seen = MAX(last_chapter_number_seen, ?1)
         WHERE id = ?2",
        params![number, source_id],
    )?;
    Ok(())
}

/// Deactivation stops discovery only; already queued jobs still run.
pub fn set_source_active(conn: &Connection, source_id: i64, active: bool) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sources SET is_active = ?1 WHERE id = ?2",
        params![active, source_id],
    )?;
    Ok(changed > 0)
}

pub fn update_source_options(
    conn: &Connection,
    source_id: i64,
    check_interval_secs: i64,
    auto_publish: bool,
    notify_on_discovery: bool,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sources SET check_interval_secs = ?1, auto_publish = ?2, notify_on_discovery = ?3
         WHERE id = ?4",
        params![check_interval_secs.max(1), auto_publish, notify_on_discovery, source_id],
    )?;
    Ok(changed > 0)
}

/// Removes the source together with its jobs and activity entries.
pub fn delete_source(conn: &Connection, source_id: i64) -> Result<bool> {
    let changed = conn.execute("DELETE FROM sources WHERE id = ?1", params![source_id])?;
    Ok(changed > 0)
}
