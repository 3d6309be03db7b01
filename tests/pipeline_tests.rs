/// Pipeline integration tests
/// Drives discovery, processing and publishing against an in-memory database
/// with scripted adapters and image hosts in place of the network

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use manga_autoscraper::app_state::AppState;
use manga_autoscraper::catalog::{self, Catalog, SqliteCatalog};
use manga_autoscraper::config::Config;
use manga_autoscraper::db::{self, SharedConnection};
use manga_autoscraper::downloader::PageFetcher;
use manga_autoscraper::error::{AdapterError, DownloadError};
use manga_autoscraper::http_client::EnhancedHttpClient;
use manga_autoscraper::models::{ActivityOutcome, ChapterDescriptor, JobStatus, NewSource, SiteFamily};
use manga_autoscraper::sources::generic::extract_pages;
use manga_autoscraper::sources::{AdapterSet, ExtractOptions, SiteAdapter};
use manga_autoscraper::{activity, processor, queue, scheduler, settings};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const SERIES: i64 = 42;
const LISTING_URL: &str = "https://reader.example/series/42";

fn chapter(number: f64) -> ChapterDescriptor {
    ChapterDescriptor {
        number,
        title: None,
        url: format!("https://reader.example/series/42/chapter-{}", number),
    }
}

fn jpeg_page() -> Bytes {
    let img = RgbImage::from_fn(320, 480, |x, y| Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    Bytes::from(buf.into_inner())
}

/// Serves a fixed listing and the same page list for every chapter.
struct FakeAdapter {
    chapters: Mutex<Vec<ChapterDescriptor>>,
    pages: Vec<String>,
    unreachable: AtomicBool,
}

#[async_trait]
impl SiteAdapter for FakeAdapter {
    async fn list_chapters(&self, _listing_url: &str) -> Result<Vec<ChapterDescriptor>, AdapterError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AdapterError::Unreachable("connection refused".to_string()));
        }
        Ok(self.chapters.lock().unwrap().clone())
    }

    async fn list_pages(&self, _chapter_url: &str, _options: &ExtractOptions) -> Result<Vec<String>, AdapterError> {
        Ok(self.pages.clone())
    }
}

/// Only the generic family is wired, so any other family has no adapter.
struct FakeAdapters {
    generic: FakeAdapter,
}

impl AdapterSet for FakeAdapters {
    fn adapter(&self, family: SiteFamily) -> Option<&dyn SiteAdapter> {
        match family {
            SiteFamily::Generic => Some(&self.generic),
            _ => None,
        }
    }
}

enum HostBehaviour {
    Healthy,
    /// Fails two requests out of every three
    Flaky,
    Down,
    /// Uploads the chapter by hand while the first page is downloading
    ManualUploadDuring { db: SharedConnection, number: f64 },
}

struct FakeHost {
    behaviour: HostBehaviour,
    requests: AtomicUsize,
}

#[async_trait]
impl PageFetcher for FakeHost {
    async fn fetch(&self, url: &str, _referer: &str) -> Result<Bytes, DownloadError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behaviour {
            HostBehaviour::Healthy => Ok(jpeg_page()),
            HostBehaviour::Flaky if n % 3 != 0 => Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: 503,
            }),
            HostBehaviour::Flaky => Ok(jpeg_page()),
            HostBehaviour::Down => Err(DownloadError::Network {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            }),
            HostBehaviour::ManualUploadDuring { db, number } => {
                if n == 1 {
                    let conn = db::lock(db);
                    SqliteCatalog.create_chapter(&conn, SERIES, *number, "Uploaded by hand", false).unwrap();
                }
                Ok(jpeg_page())
            }
        }
    }
}

struct Harness {
    state: Arc<AppState>,
    adapters: Arc<FakeAdapters>,
    host: Arc<FakeHost>,
    dir: TempDir,
}

impl Harness {
    fn new(page_count: usize, behaviour: impl FnOnce(SharedConnection) -> HostBehaviour) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.library_dir = dir.path().join("library").to_string_lossy().into_owned();
        config.staging_dir = dir.path().join("staging").to_string_lossy().into_owned();

        let adapters = Arc::new(FakeAdapters {
            generic: FakeAdapter {
                chapters: Mutex::new(Vec::new()),
                pages: (1..=page_count).map(|i| format!("https://cdn.example/42/p{}.jpg", i)).collect(),
                unreachable: AtomicBool::new(false),
            },
        });

        // the host may need the shared connection, which only exists once the state is built
        let conn = db::init_memory_db().unwrap();
        let placeholder = Arc::new(FakeHost {
            behaviour: HostBehaviour::Healthy,
            requests: AtomicUsize::new(0),
        });
        let base = AppState::with_parts(
            config.clone(),
            conn,
            Arc::new(EnhancedHttpClient::new().unwrap()),
            adapters.clone(),
            placeholder,
            Arc::new(SqliteCatalog),
        );
        let host = Arc::new(FakeHost {
            behaviour: behaviour(base.db.clone()),
            requests: AtomicUsize::new(0),
        });

        let state = AppState {
            fetcher: host.clone(),
            ..base
        };
        state.prepare_database().unwrap();
        state.settings.set(settings::RETRY_BACKOFF_MS, "0").unwrap();

        Self {
            state: Arc::new(state),
            adapters,
            host,
            dir,
        }
    }

    fn healthy(page_count: usize) -> Self {
        Self::new(page_count, |_| HostBehaviour::Healthy)
    }

    fn list(&self, numbers: &[f64]) {
        *self.adapters.generic.chapters.lock().unwrap() = numbers.iter().map(|n| chapter(*n)).collect();
    }

    fn add_source(&self, family: SiteFamily, auto_publish: bool) -> i64 {
        let mut new = NewSource::new(SERIES, family, LISTING_URL);
        new.auto_publish = auto_publish;
        db::insert_source(&db::lock(&self.state.db), &new).unwrap()
    }

    fn last_seen(&self, source_id: i64) -> f64 {
        db::get_source(&db::lock(&self.state.db), source_id)
            .unwrap()
            .unwrap()
            .last_chapter_number_seen
    }

    fn job_numbers(&self, source_id: i64) -> Vec<f64> {
        let mut numbers: Vec<f64> = queue::list_jobs_for_source(&db::lock(&self.state.db), source_id)
            .unwrap()
            .into_iter()
            .map(|j| j.chapter_number)
            .collect();
        numbers.sort_by(|a, b| a.total_cmp(b));
        numbers
    }

    fn job_status(&self, source_id: i64, number: f64) -> JobStatus {
        queue::find_job(&db::lock(&self.state.db), source_id, number)
            .unwrap()
            .unwrap()
            .status
    }

    fn staging_is_empty(&self) -> bool {
        match std::fs::read_dir(self.state.config.staging_path()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

async fn drain(h: &Harness) -> usize {
    let settings = h.state.settings.snapshot();
    processor::drain_queue(&h.state, &settings).await
}

#[tokio::test]
async fn test_discovery_enqueues_only_new_chapters() {
    let h = Harness::healthy(3);
    let source_id = h.add_source(SiteFamily::Generic, true);
    db::advance_last_chapter_seen(&db::lock(&h.state.db), source_id, 2.0).unwrap();
    h.list(&[1.0, 2.0, 2.5, 3.0]);

    let reports = scheduler::tick(&h.state).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, ActivityOutcome::Success);
    assert_eq!(reports[0].new_chapters, 2);
    assert_eq!(h.job_numbers(source_id), vec![2.5, 3.0]);

    let conn = db::lock(&h.state.db);
    let jobs = queue::list_jobs_for_source(&conn, source_id).unwrap();
    assert!(jobs.iter().all(|j| j.priority == 1 && j.status == JobStatus::Pending));

    let log = activity::recent(&conn, Some(source_id), 10).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].chapters_found, 2);
    assert!(db::get_source(&conn, source_id).unwrap().unwrap().last_checked_at.is_some());
}

#[tokio::test]
async fn test_repeated_discovery_creates_one_job_per_chapter() {
    let h = Harness::healthy(3);
    let source_id = h.add_source(SiteFamily::Generic, false);
    h.list(&[1.0, 2.0]);
    let mut events = h.state.subscribe();

    let first = scheduler::check_source(&h.state, &source_of(&h, source_id), &h.state.settings.snapshot()).await;
    let second = scheduler::check_source(&h.state, &source_of(&h, source_id), &h.state.settings.snapshot()).await;

    assert_eq!(first.enqueued, 2);
    assert_eq!(second.enqueued, 0);
    assert_eq!(h.job_numbers(source_id), vec![1.0, 2.0]);

    // one notification, for the check that actually queued something
    let event = events.try_recv().unwrap();
    assert_eq!((event.series_id, event.chapters_found), (SERIES, 2));
    assert!(events.try_recv().is_err());
}

fn source_of(h: &Harness, source_id: i64) -> manga_autoscraper::models::Source {
    db::get_source(&db::lock(&h.state.db), source_id).unwrap().unwrap()
}

#[tokio::test]
async fn test_unreachable_site_is_logged_as_failed_check() {
    let h = Harness::healthy(3);
    let source_id = h.add_source(SiteFamily::Generic, false);
    h.adapters.generic.unreachable.store(true, Ordering::SeqCst);

    let reports = scheduler::tick(&h.state).await;
    assert_eq!(reports[0].outcome, ActivityOutcome::Failed);
    assert!(h.job_numbers(source_id).is_empty());

    let conn = db::lock(&h.state.db);
    let log = activity::recent(&conn, Some(source_id), 10).unwrap();
    assert_eq!(log[0].outcome, ActivityOutcome::Failed);
    assert!(log[0].error_message.as_deref().unwrap().contains("connection refused"));
    assert!(db::get_source(&conn, source_id).unwrap().unwrap().last_checked_at.is_some());
}

#[tokio::test]
async fn test_publishes_pages_numbered_from_one() {
    let h = Harness::healthy(4);
    let source_id = h.add_source(SiteFamily::Generic, false);
    h.list(&[1.0]);

    scheduler::tick(&h.state).await;
    assert_eq!(drain(&h).await, 1);

    assert_eq!(h.job_status(source_id, 1.0), JobStatus::Completed);
    let conn = db::lock(&h.state.db);
    let pages = catalog::chapter_pages(&conn, SERIES, 1.0).unwrap();
    let names: Vec<String> = pages
        .iter()
        .map(|p| std::path::Path::new(p).file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["page_001.jpg", "page_002.jpg", "page_003.jpg", "page_004.jpg"]);
    assert!(pages.iter().all(|p| std::path::Path::new(p).exists()));
    assert_eq!(catalog::is_chapter_locked(&conn, SERIES, 1.0).unwrap(), Some(true));
    drop(conn);

    assert_eq!(h.last_seen(source_id), 1.0);
    assert!(h.staging_is_empty());
    assert!(h.dir.path().join("library").join(SERIES.to_string()).exists());
}

#[tokio::test]
async fn test_flaky_host_still_completes_with_every_page() {
    let h = Harness::new(3, |_| HostBehaviour::Flaky);
    let source_id = h.add_source(SiteFamily::Generic, true);
    h.list(&[5.0]);

    scheduler::tick(&h.state).await;
    drain(&h).await;

    assert_eq!(h.job_status(source_id, 5.0), JobStatus::Completed);
    let conn = db::lock(&h.state.db);
    assert_eq!(catalog::chapter_pages(&conn, SERIES, 5.0).unwrap().len(), 3);
    assert_eq!(catalog::is_chapter_locked(&conn, SERIES, 5.0).unwrap(), Some(false));
    assert_eq!(h.host.requests.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn test_whole_job_retry_recovers_without_image_retries() {
    let h = Harness::new(1, |_| HostBehaviour::Flaky);
    h.state.settings.set(settings::IMAGE_MAX_RETRIES, "0").unwrap();
    let source_id = h.add_source(SiteFamily::Generic, true);
    h.list(&[6.0]);
    scheduler::tick(&h.state).await;

    // each attempt makes exactly one request; the host answers every third
    assert_eq!(drain(&h).await, 1);
    assert_eq!(h.job_status(source_id, 6.0), JobStatus::Pending);
    assert_eq!(drain(&h).await, 1);
    assert_eq!(h.job_status(source_id, 6.0), JobStatus::Pending);
    assert_eq!(drain(&h).await, 1);
    assert_eq!(h.job_status(source_id, 6.0), JobStatus::Completed);
    assert_eq!(h.host.requests.load(Ordering::SeqCst), 3);

    let conn = db::lock(&h.state.db);
    let job = queue::find_job(&conn, source_id, 6.0).unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert!(job.claim_token.is_none());
    assert_eq!(catalog::chapter_pages(&conn, SERIES, 6.0).unwrap().len(), 1);
    drop(conn);
    assert_eq!(h.last_seen(source_id), 6.0);
    assert!(h.staging_is_empty());
}

#[tokio::test]
async fn test_dead_host_fails_job_after_max_attempts() {
    let h = Harness::new(2, |_| HostBehaviour::Down);
    let source_id = h.add_source(SiteFamily::Generic, false);
    h.list(&[1.0]);
    scheduler::tick(&h.state).await;

    drain(&h).await;
    assert_eq!(h.job_status(source_id, 1.0), JobStatus::Pending);
    drain(&h).await;
    assert_eq!(h.job_status(source_id, 1.0), JobStatus::Pending);
    drain(&h).await;
    assert_eq!(h.job_status(source_id, 1.0), JobStatus::Failed);

    let conn = db::lock(&h.state.db);
    let job = queue::find_job(&conn, source_id, 1.0).unwrap().unwrap();
    assert_eq!(job.attempts, 3);
    assert!(job.error_message.is_some());
    assert_eq!(catalog::count_chapters(&conn, SERIES, 1.0).unwrap(), 0);
    let log = activity::recent(&conn, Some(source_id), 10).unwrap();
    assert_eq!(log[0].outcome, ActivityOutcome::Failed);
    drop(conn);

    assert_eq!(h.last_seen(source_id), 0.0);
    assert!(h.staging_is_empty());
}

#[tokio::test]
async fn test_manual_upload_during_download_wins() {
    let h = Harness::new(3, |db| HostBehaviour::ManualUploadDuring { db, number: 7.0 });
    let source_id = h.add_source(SiteFamily::Generic, true);
    h.list(&[7.0]);

    scheduler::tick(&h.state).await;
    drain(&h).await;

    assert_eq!(h.job_status(source_id, 7.0), JobStatus::Completed);
    let conn = db::lock(&h.state.db);
    assert_eq!(catalog::count_chapters(&conn, SERIES, 7.0).unwrap(), 1);
    assert!(catalog::chapter_pages(&conn, SERIES, 7.0).unwrap().is_empty());
    drop(conn);
    assert_eq!(h.last_seen(source_id), 7.0);
    assert!(h.staging_is_empty());
}

#[tokio::test]
async fn test_last_seen_never_moves_backwards() {
    let h = Harness::healthy(3);
    let source_id = h.add_source(SiteFamily::Generic, true);
    h.list(&[3.0]);
    scheduler::tick(&h.state).await;
    drain(&h).await;
    assert_eq!(h.last_seen(source_id), 3.0);

    // a late job for an older chapter
    queue::enqueue(&db::lock(&h.state.db), source_id, &chapter(2.5), 0, 3).unwrap();
    drain(&h).await;

    assert_eq!(h.job_status(source_id, 2.5), JobStatus::Completed);
    assert_eq!(h.last_seen(source_id), 3.0);
}

#[tokio::test]
async fn test_missing_adapter_is_configuration_failure() {
    let h = Harness::healthy(3);
    let source_id = h.add_source(SiteFamily::Madara, false);

    let reports = scheduler::tick(&h.state).await;
    assert_eq!(reports[0].outcome, ActivityOutcome::Failed);
    assert!(reports[0].error.as_deref().unwrap().contains("no adapter"));

    // a job for the same source fails on its first attempt
    queue::enqueue(&db::lock(&h.state.db), source_id, &chapter(1.0), 0, 3).unwrap();
    drain(&h).await;
    let job = queue::find_job(&db::lock(&h.state.db), source_id, 1.0).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_disabled_scraping_does_no_work() {
    let h = Harness::healthy(3);
    let source_id = h.add_source(SiteFamily::Generic, false);
    h.list(&[1.0]);
    queue::enqueue(&db::lock(&h.state.db), source_id, &chapter(9.0), 0, 3).unwrap();
    h.state.settings.set(settings::SCRAPING_ENABLED, "false").unwrap();

    assert!(scheduler::tick(&h.state).await.is_empty());
    assert_eq!(h.job_numbers(source_id), vec![9.0]);

    let idle = tokio::time::timeout(Duration::from_millis(300), processor::run(h.state.clone())).await;
    assert!(idle.is_err());
    assert_eq!(h.job_status(source_id, 9.0), JobStatus::Pending);
    assert_eq!(h.host.requests.load(Ordering::SeqCst), 0);
}

#[test]
fn test_generic_page_filters_decorative_images() {
    let html = r#"<html><body>
        <header><img src="https://reader.example/assets/logo.png"></header>
        <div class="reading-content">
            <img src="https://cdn.example/42/ch3/01.jpg">
            <img src="https://reader.example/ads/banner-728x90.jpg">
            <img src="https://cdn.example/42/ch3/02.jpg">
            <img src="https://cdn.example/42/ch3/03.jpg">
            <img class="sponsor" src="https://cdn.example/promo/a.jpg">
            <img src="https://cdn.example/42/ch3/04.jpg">
            <img src="https://cdn.example/42/ch3/05.jpg">
        </div>
    </body></html>"#;

    let (pages, _) = extract_pages(html, "https://reader.example/series/42/chapter-3", &ExtractOptions::default());
    assert_eq!(
        pages,
        (1..=5).map(|i| format!("https://cdn.example/42/ch3/{:02}.jpg", i)).collect::<Vec<_>>()
    );
}
