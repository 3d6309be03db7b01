//! Downloads a chapter's pages in adapter order into a job-scoped staging
//! directory.
//!
//! Each page gets its own retry budget. A page that exhausts it fails the
//! whole chapter; pages are never skipped and renumbered.

use crate::error::{DownloadError, PipelineError, PipelineResult};
use crate::http_client::EnhancedHttpClient;
use crate::models::StagedImage;
use crate::normalize::{normalize_image, NormalizeOptions, OUTPUT_EXTENSION};
use crate::settings::PipelineSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Single-attempt page fetch. Retry policy lives in the downloader.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, referer: &str) -> Result<Bytes, DownloadError>;
}

#[async_trait]
impl PageFetcher for EnhancedHttpClient {
    async fn fetch(&self, url: &str, referer: &str) -> Result<Bytes, DownloadError> {
        self.fetch_bytes(url, referer).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Duration,
    pub min_bytes: usize,
    pub normalize: NormalizeOptions,
}

impl From<&PipelineSettings> for DownloadOptions {
    fn from(s: &PipelineSettings) -> Self {
        Self {
            max_retries: s.image_max_retries,
            backoff: s.retry_backoff,
            min_bytes: s.min_image_bytes,
            normalize: NormalizeOptions {
                max_width: s.max_image_width,
                max_height: s.max_image_height,
                jpeg_quality: s.jpeg_quality,
            },
        }
    }
}

/// Pages of one chapter sitting in staging, numbered 1..N.
#[derive(Debug)]
pub struct StagedChapter {
    pub dir: PathBuf,
    pub images: Vec<StagedImage>,
}

pub async fn remove_staging_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Could not remove staging dir {}: {}", dir.display(), e);
        }
    }
}

pub fn page_file_name(ordinal: usize) -> String {
    format!("page_{:03}.{}", ordinal, OUTPUT_EXTENSION)
}

/// Fetch and validate one page, then re-encode it off the async runtime.
async fn fetch_page(
    fetcher: &dyn PageFetcher,
    url: &str,
    referer: &str,
    options: &DownloadOptions,
) -> Result<Vec<u8>, DownloadError> {
    let bytes = fetcher.fetch(url, referer).await?;
    if bytes.len() < options.min_bytes {
        return Err(DownloadError::Undersized {
            url: url.to_string(),
            bytes: bytes.len(),
            min: options.min_bytes,
        });
    }

    let normalize = options.normalize;
    let normalized = tokio::task::spawn_blocking(move || normalize_image(&bytes, &normalize))
        .await
        .map_err(std::io::Error::other)?;
    normalized.map(|img| img.bytes).map_err(|e| DownloadError::Corrupt {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

async fn fetch_page_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    referer: &str,
    options: &DownloadOptions,
) -> Result<Vec<u8>, DownloadError> {
    let attempts = options.max_retries + 1;
    let mut attempt = 1;
    loop {
        match fetch_page(fetcher, url, referer, options).await {
            Ok(bytes) => return Ok(bytes),
            Err(e @ DownloadError::Io(_)) => return Err(e),
            Err(e) if attempt < attempts => {
                log::warn!("Page download failed ({}/{}): {}", attempt, attempts, e);
                sleep(options.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Download every page of a chapter into `staging_root/job-<id>-<uuid>/`.
/// On any failure the staging directory is removed before returning.
pub async fn download_chapter(
    fetcher: &dyn PageFetcher,
    job_id: i64,
    urls: &[String],
    referer: &str,
    staging_root: &Path,
    options: &DownloadOptions,
) -> PipelineResult<StagedChapter> {
    let dir = staging_root.join(format!("job-{}-{}", job_id, Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await?;

    match download_into(fetcher, job_id, urls, referer, &dir, options).await {
        Ok(images) => {
            log::info!("Job {}: staged {} pages in {}", job_id, images.len(), dir.display());
            Ok(StagedChapter { dir, images })
        }
        Err(e) => {
            remove_staging_dir(&dir).await;
            Err(e)
        }
    }
}

async fn download_into(
    fetcher: &dyn PageFetcher,
    job_id: i64,
    urls: &[String],
    referer: &str,
    dir: &Path,
    options: &DownloadOptions,
) -> PipelineResult<Vec<StagedImage>> {
    let mut images = Vec::with_capacity(urls.len());
    for (i, url) in urls.iter().enumerate() {
        let ordinal = i + 1;
        let bytes = fetch_page_with_retry(fetcher, url, referer, options)
            .await
            .map_err(|source| PipelineError::Download { page: ordinal, source })?;
        let path = dir.join(page_file_name(ordinal));
        tokio::fs::write(&path, &bytes).await?;
        images.push(StagedImage {
            job_id,
            ordinal,
            local_path: path,
            validated: true,
        });
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn jpeg_page() -> Bytes {
        let img = RgbImage::from_fn(300, 400, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 90]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
        Bytes::from(buf.into_inner())
    }

    /// Serves each URL from a script of responses, then repeats the last one.
    struct ScriptedFetcher {
        script: Mutex<HashMap<String, Vec<Result<Bytes, u16>>>>,
        referers: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(entries: Vec<(&str, Vec<Result<Bytes, u16>>)>) -> Self {
            Self {
                script: Mutex::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
                referers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str, referer: &str) -> Result<Bytes, DownloadError> {
            self.referers.lock().unwrap().push(referer.to_string());
            let mut script = self.script.lock().unwrap();
            let queue = script.get_mut(url).unwrap();
            let next = if queue.len() > 1 { queue.remove(0) } else { queue[0].clone() };
            next.map_err(|status| DownloadError::HttpStatus { url: url.to_string(), status })
        }
    }

    fn options() -> DownloadOptions {
        DownloadOptions {
            max_retries: 2,
            backoff: Duration::from_millis(1),
            min_bytes: 1024,
            normalize: NormalizeOptions::default(),
        }
    }

    #[tokio::test]
    async fn pages_are_numbered_in_adapter_order() {
        let staging = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            ("https://cdn.example/b.jpg", vec![Ok(jpeg_page())]),
            ("https://cdn.example/a.jpg", vec![Err(503), Ok(jpeg_page())]),
        ]);
        let urls = vec!["https://cdn.example/b.jpg".to_string(), "https://cdn.example/a.jpg".to_string()];

        let staged = download_chapter(&fetcher, 9, &urls, "https://site.example/c/1", staging.path(), &options())
            .await
            .unwrap();
        let ordinals: Vec<usize> = staged.images.iter().map(|i| i.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert!(staged.images[1].local_path.ends_with("page_002.jpg"));
        assert!(staged.images.iter().all(|i| i.local_path.exists() && i.validated));
        assert!(fetcher.referers.lock().unwrap().iter().all(|r| r == "https://site.example/c/1"));
    }

    #[tokio::test]
    async fn exhausted_page_fails_chapter_and_cleans_up() {
        let staging = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![
            ("https://cdn.example/1.jpg", vec![Ok(jpeg_page())]),
            ("https://cdn.example/2.jpg", vec![Err(500)]),
        ]);
        let urls = vec!["https://cdn.example/1.jpg".to_string(), "https://cdn.example/2.jpg".to_string()];

        let err = download_chapter(&fetcher, 1, &urls, "", staging.path(), &options())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Download { page: 2, .. }));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn tracking_pixel_is_undersized() {
        let staging = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(vec![("https://cdn.example/1.gif", vec![Ok(Bytes::from_static(b"GIF89a"))])]);
        let err = download_chapter(&fetcher, 1, &["https://cdn.example/1.gif".to_string()], "", staging.path(), &options())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Download { page: 1, source: DownloadError::Undersized { .. } }
        ));
    }

    #[tokio::test]
    async fn undecodable_body_is_corrupt() {
        let staging = tempfile::tempdir().unwrap();
        let junk = Bytes::from(vec![b'x'; 4096]);
        let fetcher = ScriptedFetcher::new(vec![("https://cdn.example/1.jpg", vec![Ok(junk)])]);
        let err = download_chapter(&fetcher, 1, &["https://cdn.example/1.jpg".to_string()], "", staging.path(), &options())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Download { source: DownloadError::Corrupt { .. }, .. }
        ));
    }
}
