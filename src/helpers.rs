//! Small helpers shared across the pipeline:
//! - chapter number extraction and formatting
//! - timestamp conversion for SQLite columns
//! - filesystem-safe names
//!
//! # Examples
//!
//! ```
//! use manga_autoscraper::helpers::{extract_chapter_number, format_chapter_number};
//!
//! assert_eq!(extract_chapter_number("Chapter 12.5 - The Return"), Some(12.5));
//! assert_eq!(format_chapter_number(3.0), "3");
//! ```

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

static CHAPTER_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:chapter|chap|ch|episode|ep|cap[ií]tulo|cap)\.?[\s\-_]*(\d+(?:\.\d+)?)")
        .expect("chapter label regex")
});

static CHAPTER_SLUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:chapter|chap|ch)[\-_/](\d+)(?:[\-_.](\d+))?").expect("chapter slug regex")
});

static FIRST_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("number regex"));

/// Pull a chapter number out of link text such as "Chapter 12.5" or "Ch. 7".
pub fn extract_chapter_number(text: &str) -> Option<f64> {
    CHAPTER_LABEL_RE
        .captures(text)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|n| n.is_finite() && *n >= 0.0)
}

/// Pull a chapter number out of a URL slug such as `/chapter-12-5/`.
pub fn extract_chapter_number_from_url(url: &str) -> Option<f64> {
    let cap = CHAPTER_SLUG_RE.captures(url)?;
    let whole = cap.get(1)?.as_str();
    let raw = match cap.get(2) {
        Some(frac) => format!("{}.{}", whole, frac.as_str()),
        None => whole.to_string(),
    };
    raw.parse::<f64>().ok()
}

/// First bare number in a string; used for API fields like `"12.5"`.
pub fn extract_number(text: &str) -> Option<f64> {
    FIRST_NUMBER_RE
        .captures(text)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Render a chapter number without a trailing `.0`.
pub fn format_chapter_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        let s = format!("{:.3}", n);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

pub fn to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_default()
}

pub fn from_opt_timestamp(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(from_timestamp)
}

pub fn sanitize_filename(s: &str) -> String {
    s.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
}
