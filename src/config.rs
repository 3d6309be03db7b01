use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Bootstrap configuration read once at start-up from `config.toml`.
///
/// Operator-tunable pipeline knobs live in the Settings Store instead; this
/// file only holds what must be known before the database is open.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Final location of published page files.
    #[serde(default = "default_library_dir")]
    pub library_dir: String,
    /// Job-scoped transient images live here until publish or failure.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_mangadex_api_url")]
    pub mangadex_api_url: String,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Default timeout for HTTP requests in seconds (overridden at runtime by
    /// the `request_timeout_secs` setting)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of retry attempts for failed page requests
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Enable cookie support
    #[serde(default = "default_true")]
    pub enable_cookies: bool,

    /// Enable gzip/brotli compression
    #[serde(default = "default_true")]
    pub enable_compression: bool,
}

fn default_database_path() -> String { "autoscraper.db".to_string() }
fn default_library_dir() -> String { "library".to_string() }
fn default_staging_dir() -> String { "staging".to_string() }
fn default_mangadex_api_url() -> String { "https://api.mangadex.org".to_string() }
fn default_true() -> bool { true }
fn default_max_retries() -> usize { 3 }
fn default_initial_retry_delay() -> u64 { 500 }
fn default_max_retry_delay() -> u64 { 8000 }
fn default_timeout() -> u64 { 30 }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
            enable_cookies: true,
            enable_compression: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            library_dir: default_library_dir(),
            staging_dir: default_staging_dir(),
            mangadex_api_url: default_mangadex_api_url(),
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(Path::new("config.toml"))
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            log::info!("{} not found, using default configuration", path.display());
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(cfg) => cfg,
                Err(e) => {
                    log::warn!("Invalid {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Could not read {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn library_path(&self) -> PathBuf {
        PathBuf::from(&self.library_dir)
    }

    pub fn staging_path(&self) -> PathBuf {
        PathBuf::from(&self.staging_dir)
    }
}

impl HttpConfig {
    /// Create the retrying HTTP client from this configuration
    pub fn create_http_client(
        &self,
    ) -> Result<crate::http_client::EnhancedHttpClient, reqwest::Error> {
        use crate::http_client::{EnhancedHttpClient, HttpClientConfig};
        use std::time::Duration;

        let config = HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            initial_retry_delay_ms: self.initial_retry_delay_ms,
            max_retry_delay_ms: self.max_retry_delay_ms,
            enable_cookies: self.enable_cookies,
            enable_gzip: self.enable_compression,
        };

        EnhancedHttpClient::with_config(config)
    }
}
