//! Settings Store: operator-tunable key/value settings with compiled-in
//! defaults, read through a cache that is invalidated per key on write.

use crate::db::{self, SharedConnection};
use crate::helpers::to_timestamp;
use crate::models::Setting;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Result};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

pub const SCRAPING_ENABLED: &str = "scraping_enabled";
pub const MAX_CONCURRENT_DOWNLOADS: &str = "max_concurrent_downloads";
pub const REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";
pub const ADAPTER_TIMEOUT_SECS: &str = "adapter_timeout_secs";
pub const SCAN_INTERVAL_SECS: &str = "scan_interval_secs";
pub const QUEUE_POLL_INTERVAL_SECS: &str = "queue_poll_interval_secs";
pub const IMAGE_MAX_RETRIES: &str = "image_max_retries";
pub const RETRY_BACKOFF_MS: &str = "retry_backoff_ms";
pub const JOB_MAX_ATTEMPTS: &str = "job_max_attempts";
pub const DECORATIVE_FILTER_ENABLED: &str = "decorative_filter_enabled";
pub const MIN_IMAGE_BYTES: &str = "min_image_bytes";
pub const MIN_PAGE_COUNT: &str = "min_page_count";
pub const MAX_IMAGE_WIDTH: &str = "max_image_width";
pub const MAX_IMAGE_HEIGHT: &str = "max_image_height";
pub const JPEG_QUALITY: &str = "jpeg_quality";
pub const STALE_JOB_SECS: &str = "stale_job_secs";
pub const LOG_RETENTION_DAYS: &str = "log_retention_days";
pub const JOB_RETENTION_DAYS: &str = "job_retention_days";
pub const CLEANUP_INTERVAL_SECS: &str = "cleanup_interval_secs";

/// (key, default, description)
pub const DEFAULTS: &[(&str, &str, &str)] = &[
    (SCRAPING_ENABLED, "true", "Enable automatic discovery and ingestion"),
    (MAX_CONCURRENT_DOWNLOADS, "3", "Number of parallel queue workers"),
    (REQUEST_TIMEOUT_SECS, "30", "Timeout for a single HTTP request"),
    (ADAPTER_TIMEOUT_SECS, "90", "Upper bound on one chapter or page listing call"),
    (SCAN_INTERVAL_SECS, "600", "Seconds between discovery ticks"),
    (QUEUE_POLL_INTERVAL_SECS, "30", "Seconds the processor sleeps when the queue is empty"),
    (IMAGE_MAX_RETRIES, "2", "Retries per image after the first attempt"),
    (RETRY_BACKOFF_MS, "2000", "Delay between image retries"),
    (JOB_MAX_ATTEMPTS, "3", "Attempts before a job is marked failed"),
    (DECORATIVE_FILTER_ENABLED, "true", "Drop logos, banners and icons on generic sites"),
    (MIN_IMAGE_BYTES, "1024", "Responses smaller than this are rejected"),
    (MIN_PAGE_COUNT, "3", "Scan inline scripts when fewer pages are found"),
    (MAX_IMAGE_WIDTH, "1200", "Pages wider than this are scaled down"),
    (MAX_IMAGE_HEIGHT, "1800", "Pages taller than this are scaled down"),
    (JPEG_QUALITY, "85", "JPEG quality for normalized pages"),
    (STALE_JOB_SECS, "1800", "Processing jobs older than this are reclaimed"),
    (LOG_RETENTION_DAYS, "30", "Days to keep activity log entries"),
    (JOB_RETENTION_DAYS, "7", "Days to keep completed and failed jobs"),
    (CLEANUP_INTERVAL_SECS, "3600", "Seconds between retention sweeps"),
];

pub fn default_value(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _, _)| *k == key).map(|(_, v, _)| *v)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Typed view of every pipeline setting, taken once per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub scraping_enabled: bool,
    pub max_concurrent_downloads: usize,
    pub request_timeout: Duration,
    pub adapter_timeout: Duration,
    pub scan_interval: Duration,
    pub queue_poll_interval: Duration,
    pub image_max_retries: u32,
    pub retry_backoff: Duration,
    pub job_max_attempts: i64,
    pub decorative_filter_enabled: bool,
    pub min_image_bytes: usize,
    pub min_page_count: usize,
    pub max_image_width: u32,
    pub max_image_height: u32,
    pub jpeg_quality: u8,
    pub stale_job_after: Duration,
    pub log_retention_days: i64,
    pub job_retention_days: i64,
    pub cleanup_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            scraping_enabled: true,
            max_concurrent_downloads: 3,
            request_timeout: Duration::from_secs(30),
            adapter_timeout: Duration::from_secs(90),
            scan_interval: Duration::from_secs(600),
            queue_poll_interval: Duration::from_secs(30),
            image_max_retries: 2,
            retry_backoff: Duration::from_millis(2000),
            job_max_attempts: 3,
            decorative_filter_enabled: true,
            min_image_bytes: 1024,
            min_page_count: 3,
            max_image_width: 1200,
            max_image_height: 1800,
            jpeg_quality: 85,
            stale_job_after: Duration::from_secs(1800),
            log_retention_days: 30,
            job_retention_days: 7,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

pub struct SettingsStore {
    db: SharedConnection,
    cache: RwLock<HashMap<String, String>>,
}

impl SettingsStore {
    pub fn new(db: SharedConnection) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Insert every known key that is not already stored.
    pub fn seed_defaults(&self) -> Result<()> {
        let conn = db::lock(&self.db);
        let now = to_timestamp(Utc::now());
        for (key, value, description) in DEFAULTS {
            conn.execute(
                "INSERT OR IGNORE INTO settings (key, value, description, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, value, description, now],
            )?;
        }
        Ok(())
    }

    /// Raw value: cache, then database, then compiled-in default.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.cache.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Some(v.clone());
        }

        let stored: Result<Option<String>> = {
            let conn = db::lock(&self.db);
            conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
        };
        let value = match stored {
            Ok(Some(v)) => Some(v),
            Ok(None) => default_value(key).map(str::to_string),
            Err(e) => {
                log::error!("Failed to read setting {}: {}", key, e);
                return default_value(key).map(str::to_string);
            }
        };

        if let Some(v) = &value {
            self.cache
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.to_string(), v.clone());
        }
        value
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .and_then(|v| parse_bool(&v))
            .or_else(|| default_value(key).and_then(parse_bool))
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .or_else(|| {
                log::warn!("Setting {} is not a number, using default", key);
                default_value(key).and_then(|v| v.parse().ok())
            })
            .unwrap_or(0)
    }

    /// Upsert a value and drop its cached copy.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let conn = db::lock(&self.db);
            conn.execute(
                "INSERT INTO settings (key, value, description, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, describe(key), to_timestamp(Utc::now())],
            )?;
        }
        self.invalidate(key);
        log::info!("Setting {} updated to {}", key, value);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn list(&self) -> Result<Vec<Setting>> {
        let conn = db::lock(&self.db);
        let mut stmt = conn.prepare("SELECT key, value, description FROM settings ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok(Setting {
                key: row.get(0)?,
                value: row.get(1)?,
                description: row.get(2)?,
            })
        })?;
        rows.collect()
    }

    pub fn snapshot(&self) -> PipelineSettings {
        let secs = |key| Duration::from_secs(self.get_u64(key));
        PipelineSettings {
            scraping_enabled: self.get_bool(SCRAPING_ENABLED),
            max_concurrent_downloads: (self.get_u64(MAX_CONCURRENT_DOWNLOADS) as usize).max(1),
            request_timeout: secs(REQUEST_TIMEOUT_SECS).max(Duration::from_secs(1)),
            adapter_timeout: secs(ADAPTER_TIMEOUT_SECS).max(Duration::from_secs(1)),
            scan_interval: secs(SCAN_INTERVAL_SECS).max(Duration::from_secs(1)),
            queue_poll_interval: secs(QUEUE_POLL_INTERVAL_SECS).max(Duration::from_secs(1)),
            image_max_retries: self.get_u64(IMAGE_MAX_RETRIES).min(u32::MAX as u64) as u32,
            retry_backoff: Duration::from_millis(self.get_u64(RETRY_BACKOFF_MS)),
            job_max_attempts: i64::try_from(self.get_u64(JOB_MAX_ATTEMPTS)).unwrap_or(i64::MAX).max(1),
            decorative_filter_enabled: self.get_bool(DECORATIVE_FILTER_ENABLED),
            min_image_bytes: self.get_u64(MIN_IMAGE_BYTES) as usize,
            min_page_count: self.get_u64(MIN_PAGE_COUNT) as usize,
            max_image_width: self.get_u64(MAX_IMAGE_WIDTH).clamp(1, u32::MAX as u64) as u32,
            max_image_height: self.get_u64(MAX_IMAGE_HEIGHT).clamp(1, u32::MAX as u64) as u32,
            jpeg_quality: self.get_u64(JPEG_QUALITY).clamp(1, 100) as u8,
            stale_job_after: secs(STALE_JOB_SECS),
            log_retention_days: i64::try_from(self.get_u64(LOG_RETENTION_DAYS)).unwrap_or(i64::MAX),
            job_retention_days: i64::try_from(self.get_u64(JOB_RETENTION_DAYS)).unwrap_or(i64::MAX),
            cleanup_interval: secs(CLEANUP_INTERVAL_SECS).max(Duration::from_secs(1)),
        }
    }
}

fn describe(key: &str) -> Option<&'static str> {
    DEFAULTS.iter().find(|(k, _, _)| *k == key).map(|(_, _, d)| *d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn store() -> SettingsStore {
        let conn = db::init_memory_db().unwrap();
        db::create_tables(&conn).unwrap();
        SettingsStore::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn unseeded_store_uses_defaults() {
        let store = store();
        assert_eq!(store.snapshot(), PipelineSettings::default());
    }

    #[test]
    fn seeded_values_match_defaults() {
        let store = store();
        store.seed_defaults().unwrap();
        assert_eq!(store.list().unwrap().len(), DEFAULTS.len());
        assert_eq!(store.snapshot(), PipelineSettings::default());
    }

    #[test]
    fn write_invalidates_cache() {
        let store = store();
        store.seed_defaults().unwrap();
        assert_eq!(store.get_u64(MAX_CONCURRENT_DOWNLOADS), 3);
        store.set(MAX_CONCURRENT_DOWNLOADS, "8").unwrap();
        assert_eq!(store.get_u64(MAX_CONCURRENT_DOWNLOADS), 8);
        store.set(SCRAPING_ENABLED, "off").unwrap();
        assert!(!store.snapshot().scraping_enabled);
    }

    #[test]
    fn garbage_values_fall_back_to_default() {
        let store = store();
        store.set(JPEG_QUALITY, "very high").unwrap();
        assert_eq!(store.snapshot().jpeg_quality, 85);
        store.set(DECORATIVE_FILTER_ENABLED, "maybe").unwrap();
        assert!(store.snapshot().decorative_filter_enabled);
    }

    #[test]
    fn huge_values_saturate() {
        let store = store();
        store.set(LOG_RETENTION_DAYS, &u64::MAX.to_string()).unwrap();
        store.set(JOB_MAX_ATTEMPTS, &u64::MAX.to_string()).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.log_retention_days, i64::MAX);
        assert_eq!(settings.job_max_attempts, i64::MAX);
    }

    #[test]
    fn unknown_keys_are_none() {
        assert!(store().get("does_not_exist").is_none());
    }
}
