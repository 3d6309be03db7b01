//! Append-only Activity Log of discovery attempts.

use crate::helpers::{from_timestamp, to_timestamp};
use crate::models::{ActivityLogEntry, ActivityOutcome};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Result, Row};

/// Entry as written by the scheduler; the id is assigned on insert.
#[derive(Debug, Clone)]
pub struct NewActivity<'a> {
    pub source_id: i64,
    pub checked_at: DateTime<Utc>,
    pub outcome: ActivityOutcome,
    pub chapters_found: usize,
    pub execution_time_ms: u128,
    pub error_message: Option<&'a str>,
}

pub fn append(conn: &Connection, entry: &NewActivity<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO activity_log (source_id, checked_at, outcome, chapters_found,
                                   execution_time_ms, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.source_id,
            to_timestamp(entry.checked_at),
            entry.outcome.as_str(),
            entry.chapters_found as i64,
            i64::try_from(entry.execution_time_ms).unwrap_or(i64::MAX),
            entry.error_message,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn entry_from_row(row: &Row<'_>) -> Result<ActivityLogEntry> {
    let outcome: String = row.get(3)?;
    let outcome = outcome
        .parse::<ActivityOutcome>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    Ok(ActivityLogEntry {
        id: row.get(0)?,
        source_id: row.get(1)?,
        checked_at: from_timestamp(row.get(2)?),
        outcome,
        chapters_found: row.get(4)?,
        execution_time_ms: row.get(5)?,
        error_message: row.get(6)?,
    })
}

/// Most recent entries first, optionally for a single Source.
pub fn recent(conn: &Connection, source_id: Option<i64>, limit: usize) -> Result<Vec<ActivityLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, source_id, checked_at, outcome, chapters_found, execution_time_ms, error_message
         FROM activity_log
         WHERE ?1 IS NULL OR source_id = ?1
         ORDER BY checked_at DESC, id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![source_id, limit as i64], entry_from_row)?;
    rows.collect()
}

pub fn purge_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "DELETE FROM activity_log WHERE checked_at < ?1",
        params![to_timestamp(cutoff)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{NewSource, SiteFamily};
    use chrono::Duration;

    #[test]
    fn append_and_read_back() {
        let conn = db::init_memory_db().unwrap();
        db::create_tables(&conn).unwrap();
        let a = db::insert_source(&conn, &NewSource::new(1, SiteFamily::Generic, "https://a.example")).unwrap();
        let b = db::insert_source(&conn, &NewSource::new(2, SiteFamily::Generic, "https://b.example")).unwrap();
        let now = Utc::now();

        append(&conn, &NewActivity {
            source_id: a,
            checked_at: now - Duration::days(40),
            outcome: ActivityOutcome::NoNewChapters,
            chapters_found: 0,
            execution_time_ms: 12,
            error_message: None,
        })
        .unwrap();
        append(&conn, &NewActivity {
            source_id: b,
            checked_at: now,
            outcome: ActivityOutcome::Failed,
            chapters_found: 0,
            execution_time_ms: 90_000,
            error_message: Some("source unreachable: timeout"),
        })
        .unwrap();

        assert_eq!(recent(&conn, None, 10).unwrap().len(), 2);
        let for_b = recent(&conn, Some(b), 10).unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].outcome, ActivityOutcome::Failed);
        assert_eq!(for_b[0].error_message.as_deref(), Some("source unreachable: timeout"));

        assert_eq!(purge_older_than(&conn, now - Duration::days(30)).unwrap(), 1);
        assert_eq!(recent(&conn, None, 10).unwrap().len(), 1);
    }
}
