use crate::error::{AdapterError, DownloadError};
use bytes::Bytes;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::{Client, ClientBuilder, Response};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// User agents to rotate through to avoid bot detection
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

/// Configuration for the retrying HTTP client
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_retries: usize,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub enable_cookies: bool,
    pub enable_gzip: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 8000,
            enable_cookies: true,
            enable_gzip: true,
        }
    }
}

/// HTTP client shared by site adapters and the image downloader.
///
/// Page and API fetches retry retryable statuses with exponential backoff.
/// Image fetches are single attempts; the downloader owns that retry policy.
pub struct EnhancedHttpClient {
    client: Client,
    config: HttpClientConfig,
    request_timeout_ms: AtomicU64,
}

impl EnhancedHttpClient {
    /// Create a new client with default configuration
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_config(HttpClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert("DNT", HeaderValue::from_static("1"));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .user_agent(Self::random_user_agent())
            .cookie_store(config.enable_cookies)
            .gzip(config.enable_gzip)
            .brotli(config.enable_gzip)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .redirect(reqwest::redirect::Policy::limited(10))
            .default_headers(headers)
            .build()?;

        let request_timeout_ms = AtomicU64::new(config.timeout.as_millis() as u64);
        Ok(Self {
            client,
            config,
            request_timeout_ms,
        })
    }

    /// Apply the operator's per-request timeout to subsequent requests.
    pub fn set_request_timeout(&self, timeout: Duration) {
        self.request_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.load(Ordering::Relaxed))
    }

    /// Get a random user agent from the pool
    fn random_user_agent() -> &'static str {
        let mut rng = rand::thread_rng();
        USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
    }

    /// Calculate retry delay with exponential backoff and jitter
    fn calculate_retry_delay(&self, attempt: usize) -> Duration {
        let base_delay = self.config.initial_retry_delay_ms;
        let max_delay = self.config.max_retry_delay_ms;

        let delay_ms = base_delay
            .saturating_mul(2u64.saturating_pow(attempt as u32))
            .min(max_delay);

        // ±25% jitter
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((delay_ms as f64 * jitter) as u64)
    }

    /// Check if a status code is retryable
    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        matches!(
            status.as_u16(),
            429 | 500 | 502 | 503 | 504 | 520 | 521 | 522 | 523 | 524 | 525 | 526 | 527
        )
    }

    /// Fetch a URL with retry logic
    pub async fn get_with_retry(&self, url: &str) -> Result<Response, reqwest::Error> {
        let mut attempt = 0usize;
        loop {
            let request = self
                .client
                .get(url)
                .header(USER_AGENT, Self::random_user_agent())
                .timeout(self.request_timeout());

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if Self::is_retryable_status(status) && attempt < self.config.max_retries {
                        log::warn!(
                            "Received retryable status {} for {}, attempt {}/{}",
                            status,
                            url,
                            attempt + 1,
                            self.config.max_retries + 1
                        );
                        sleep(self.calculate_retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let should_retry = e.is_timeout() || e.is_connect() || e.is_request();
                    if should_retry && attempt < self.config.max_retries {
                        log::warn!(
                            "Request failed for {}, attempt {}/{}: {}",
                            url,
                            attempt + 1,
                            self.config.max_retries + 1,
                            e
                        );
                        sleep(self.calculate_retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Fetch a page and return its body, classifying failures for adapters.
    pub async fn get_text(&self, url: &str) -> Result<String, AdapterError> {
        let response = self.get_with_retry(url).await?.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Fetch and decode a JSON API response.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, AdapterError> {
        let text = self.get_text(url).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Single attempt image fetch with a hot-link `Referer`.
    pub async fn fetch_bytes(&self, url: &str, referer: &str) -> Result<Bytes, DownloadError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, Self::random_user_agent())
            .header(ACCEPT, IMAGE_ACCEPT)
            .timeout(self.request_timeout());
        if !referer.is_empty() {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| DownloadError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.bytes().await.map_err(|e| DownloadError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Get the underlying reqwest client for direct access
    pub fn client(&self) -> &Client {
        &self.client
    }
}
