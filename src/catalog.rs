//! Boundary to the host catalog that owns series, chapters and pages.
//!
//! The pipeline only needs three things from it: ask whether a chapter
//! already exists, create one, and attach its pages. Every call takes the
//! caller's connection so the publisher can run them inside its own
//! transaction.

use crate::helpers::to_timestamp;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::path::PathBuf;

/// Chapter numbers closer than this are the same chapter.
const NUMBER_EPSILON: f64 = 1e-6;

pub trait Catalog: Send + Sync {
    fn chapter_exists(&self, conn: &Connection, series_id: i64, number: f64) -> Result<bool>;

    fn create_chapter(
        &self,
        conn: &Connection,
        series_id: i64,
        number: f64,
        title: &str,
        locked: bool,
    ) -> Result<i64>;

    /// Attach pages in order; `pages[0]` becomes page 1.
    fn create_pages(&self, conn: &Connection, chapter_id: i64, pages: &[PathBuf]) -> Result<()>;
}

/// Catalog backed by the `catalog_chapters` / `catalog_pages` tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteCatalog;

impl Catalog for SqliteCatalog {
    fn chapter_exists(&self, conn: &Connection, series_id: i64, number: f64) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM catalog_chapters WHERE series_id = ?1 AND ABS(number - ?2) < ?3",
                params![series_id, number, NUMBER_EPSILON],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create_chapter(
        &self,
        conn: &Connection,
        series_id: i64,
        number: f64,
        title: &str,
        locked: bool,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO catalog_chapters (series_id, number, title, locked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![series_id, number, title, locked, to_timestamp(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn create_pages(&self, conn: &Connection, chapter_id: i64, pages: &[PathBuf]) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO catalog_pages (chapter_id, page_number, image_path) VALUES (?1, ?2, ?3)",
        )?;
        for (i, path) in pages.iter().enumerate() {
            stmt.execute(params![chapter_id, (i + 1) as i64, path.to_string_lossy()])?;
        }
        conn.execute(
            "UPDATE catalog_chapters SET page_count = ?1 WHERE id = ?2",
            params![pages.len() as i64, chapter_id],
        )?;
        Ok(())
    }
}

/// Page paths for a chapter in page order. Used by operators and tests.
pub fn chapter_pages(conn: &Connection, series_id: i64, number: f64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT p.image_path FROM catalog_pages p
         JOIN catalog_chapters c ON c.id = p.chapter_id
         WHERE c.series_id = ?1 AND ABS(c.number - ?2) < ?3
         ORDER BY p.page_number",
    )?;
    let rows = stmt.query_map(params![series_id, number, NUMBER_EPSILON], |row| row.get(0))?;
    rows.collect()
}

/// Number of catalog chapters recorded for a series at a given number.
pub fn count_chapters(conn: &Connection, series_id: i64, number: f64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM catalog_chapters WHERE series_id = ?1 AND ABS(number - ?2) < ?3",
        params![series_id, number, NUMBER_EPSILON],
        |row| row.get(0),
    )
}

pub fn is_chapter_locked(conn: &Connection, series_id: i64, number: f64) -> Result<Option<bool>> {
    conn.query_row(
        "SELECT locked FROM catalog_chapters WHERE series_id = ?1 AND ABS(number - ?2) < ?3",
        params![series_id, number, NUMBER_EPSILON],
        |row| row.get(0),
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn create_and_find_chapter() {
        let conn = db::init_memory_db().unwrap();
        db::create_tables(&conn).unwrap();
        let catalog = SqliteCatalog;

        assert!(!catalog.chapter_exists(&conn, 1, 2.5).unwrap());
        let id = catalog.create_chapter(&conn, 1, 2.5, "Chapter 2.5", true).unwrap();
        catalog
            .create_pages(&conn, id, &[PathBuf::from("a.jpg"), PathBuf::from("b.jpg")])
            .unwrap();

        assert!(catalog.chapter_exists(&conn, 1, 2.5).unwrap());
        assert!(!catalog.chapter_exists(&conn, 2, 2.5).unwrap());
        assert_eq!(chapter_pages(&conn, 1, 2.5).unwrap(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(is_chapter_locked(&conn, 1, 2.5).unwrap(), Some(true));
    }

    #[test]
    fn duplicate_chapter_is_rejected() {
        let conn = db::init_memory_db().unwrap();
        db::create_tables(&conn).unwrap();
        let catalog = SqliteCatalog;
        catalog.create_chapter(&conn, 1, 3.0, "Chapter 3", false).unwrap();
        assert!(catalog.create_chapter(&conn, 1, 3.0, "Chapter 3", false).is_err());
    }
}
