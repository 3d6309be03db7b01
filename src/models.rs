use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// External site families with a dedicated parsing strategy.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SiteFamily {
    MangaDex,
    Manganelo,
    Mangakakalot,
    Madara,
    Generic,
}

impl SiteFamily {
    pub const ALL: [SiteFamily; 5] = [
        SiteFamily::MangaDex,
        SiteFamily::Manganelo,
        SiteFamily::Mangakakalot,
        SiteFamily::Madara,
        SiteFamily::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SiteFamily::MangaDex => "mangadex",
            SiteFamily::Manganelo => "manganelo",
            SiteFamily::Mangakakalot => "mangakakalot",
            SiteFamily::Madara => "madara",
            SiteFamily::Generic => "generic",
        }
    }
}

impl fmt::Display for SiteFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mangadex" | "mangadx" => Ok(SiteFamily::MangaDex),
            "manganelo" | "manganato" => Ok(SiteFamily::Manganelo),
            "mangakakalot" => Ok(SiteFamily::Mangakakalot),
            "madara" | "wp-manga" | "wp_manga" => Ok(SiteFamily::Madara),
            "generic" => Ok(SiteFamily::Generic),
            other => Err(format!("unknown site family '{}'", other)),
        }
    }
}

/// A (series, external site) monitoring record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Source {
    pub id: i64,
    pub series_id: i64,
    /// Kept as text so a row with an unknown family is still loadable and can
    /// be skipped with a logged reason.
    pub site_family: String,
    pub listing_url: String,
    pub check_interval_secs: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_chapter_number_seen: f64,
    pub is_active: bool,
    pub auto_publish: bool,
    pub notify_on_discovery: bool,
}

impl Source {
    pub fn family(&self) -> Result<SiteFamily, String> {
        self.site_family.parse()
    }
}

/// Operator input for registering a Source.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NewSource {
    pub series_id: i64,
    pub site_family: SiteFamily,
    pub listing_url: String,
    pub check_interval_secs: i64,
    pub auto_publish: bool,
    pub notify_on_discovery: bool,
}

impl NewSource {
    pub fn new(series_id: i64, site_family: SiteFamily, listing_url: impl Into<String>) -> Self {
        Self {
            series_id,
            site_family,
            listing_url: listing_url.into(),
            check_interval_secs: 3600,
            auto_publish: false,
            notify_on_discovery: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued unit of work: ingest chapter N of source S.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub source_id: i64,
    pub chapter_number: f64,
    pub chapter_url: String,
    pub chapter_title: Option<String>,
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when a worker claims the job; used for stale detection.
    pub started_at: Option<DateTime<Utc>>,
    /// Lease of the current claim. Outcomes from an older claim are ignored.
    pub claim_token: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Claim token, empty when the Job is not claimed.
    pub fn claim(&self) -> &str {
        self.claim_token.as_deref().unwrap_or_default()
    }

    pub fn display_title(&self) -> String {
        match &self.chapter_title {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => format!("Chapter {}", crate::helpers::format_chapter_number(self.chapter_number)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityOutcome {
    Success,
    NoNewChapters,
    Failed,
}

impl ActivityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityOutcome::Success => "success",
            ActivityOutcome::NoNewChapters => "no_new_chapters",
            ActivityOutcome::Failed => "failed",
        }
    }
}

impl FromStr for ActivityOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ActivityOutcome::Success),
            "no_new_chapters" => Ok(ActivityOutcome::NoNewChapters),
            "failed" => Ok(ActivityOutcome::Failed),
            other => Err(format!("unknown activity outcome '{}'", other)),
        }
    }
}

/// Append-only record of one discovery attempt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub source_id: i64,
    pub checked_at: DateTime<Utc>,
    pub outcome: ActivityOutcome,
    pub chapters_found: i64,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
}

/// A downloaded, validated and re-encoded page waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedImage {
    pub job_id: i64,
    /// 1-based page number in reading order.
    pub ordinal: usize,
    pub local_path: PathBuf,
    pub validated: bool,
}

/// A chapter as listed by a site adapter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChapterDescriptor {
    pub number: f64,
    pub title: Option<String>,
    pub url: String,
}

/// Raised when discovery enqueues new chapters for a source that asked to be
/// notified.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiscoveryEvent {
    pub source_id: i64,
    pub series_id: i64,
    pub chapters_found: usize,
}
