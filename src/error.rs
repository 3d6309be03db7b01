//! Error taxonomy for the ingestion pipeline.
//!
//! Adapter and download failures are caught at the Job boundary and turned
//! into queue transitions; they never escape the scheduler or the processor.

use thiserror::Error;

/// Failure raised by a site adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The site could not be reached (DNS, connect, timeout, 5xx, 429).
    #[error("source unreachable: {0}")]
    Unreachable(String),
    /// The site answered but its layout or API payload was not recognised.
    #[error("page structure not recognized: {0}")]
    Structure(String),
}

impl AdapterError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, AdapterError::Unreachable(_))
    }
}

/// Coarse failure category tallied per site family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unreachable,
    Structure,
    Timeout,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::Structure => "structure",
            FailureKind::Timeout => "timeout",
            FailureKind::Other => "other",
        }
    }
}

/// Errors that can say which [`FailureKind`] they belong to.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for AdapterError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            AdapterError::Unreachable(_) => FailureKind::Unreachable,
            AdapterError::Structure(_) => FailureKind::Structure,
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return AdapterError::Structure(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 404 || status.as_u16() == 410 => {
                AdapterError::Structure(format!("{} returned {}", url_of(&e), status))
            }
            _ => AdapterError::Unreachable(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        AdapterError::Structure(format!("unexpected API payload: {}", e))
    }
}

fn url_of(e: &reqwest::Error) -> String {
    e.url().map(|u| u.to_string()).unwrap_or_default()
}

/// Failure fetching or validating a single page image.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },
    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("{url} returned {bytes} bytes, below the {min} byte minimum")]
    Undersized { url: String, bytes: usize, min: usize },
    #[error("{url} is not a decodable image: {reason}")]
    Corrupt { url: String, reason: String },
    #[error("i/o error while staging images: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can fail a Job.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("page {page} failed: {source}")]
    Download {
        page: usize,
        #[source]
        source: DownloadError,
    },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("adapter call timed out after {0}s")]
    Timeout(u64),
    /// Globally disabled pipeline, unknown site family, missing source row.
    /// These never start a retry loop.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the Job should go back to `pending` (when attempts remain)
    /// instead of failing immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineError::Config(_))
    }

    /// Network trouble on the remote side, as opposed to a broken page or
    /// a local fault.
    pub fn is_transient(&self) -> bool {
        matches!(self.failure_kind(), FailureKind::Unreachable | FailureKind::Timeout)
    }
}

impl Classify for PipelineError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::Adapter(e) => e.failure_kind(),
            PipelineError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Other,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_do_not_retry() {
        assert!(!PipelineError::Config("no adapter".into()).is_retryable());
        assert!(PipelineError::Timeout(30).is_retryable());
        assert!(PipelineError::Adapter(AdapterError::Structure("x".into())).is_retryable());
    }

    #[test]
    fn failure_kind_follows_the_variant() {
        // the message mentions a timeout but the site answered with garbage
        let structure = PipelineError::from(AdapterError::Structure("reader timeout banner".into()));
        assert_eq!(structure.failure_kind(), FailureKind::Structure);
        assert!(!structure.is_transient());

        let unreachable = PipelineError::from(AdapterError::Unreachable("connection refused".into()));
        assert_eq!(unreachable.failure_kind(), FailureKind::Unreachable);
        assert!(unreachable.is_transient());

        assert_eq!(PipelineError::Timeout(90).failure_kind(), FailureKind::Timeout);
        assert!(PipelineError::Timeout(90).is_transient());
        assert_eq!(PipelineError::Config("x".into()).failure_kind(), FailureKind::Other);
    }

    #[test]
    fn download_error_names_the_page() {
        let err = PipelineError::Download {
            page: 4,
            source: DownloadError::Undersized {
                url: "https://cdn.example/4.jpg".into(),
                bytes: 43,
                min: 1024,
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("page 4 failed"));
    }
}
