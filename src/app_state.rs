//! Shared state handed to every long-running task.
//!
//! The scheduler, processor and maintenance loops each hold an
//! `Arc<AppState>`. They never talk to each other directly; all
//! coordination goes through the database.

use crate::catalog::{Catalog, SqliteCatalog};
use crate::config::Config;
use crate::db::{self, SharedConnection};
use crate::downloader::PageFetcher;
use crate::http_client::EnhancedHttpClient;
use crate::metrics::MetricsTracker;
use crate::models::DiscoveryEvent;
use crate::settings::SettingsStore;
use crate::sources::{AdapterSet, SiteAdapters};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct AppState {
    /// Single SQLite connection shared by all tasks
    pub db: SharedConnection,
    /// Retrying HTTP client; its request timeout follows the settings
    pub client: Arc<EnhancedHttpClient>,
    pub settings: SettingsStore,
    /// Per-family adapter metrics
    pub metrics: MetricsTracker,
    pub config: Config,
    pub adapters: Arc<dyn AdapterSet>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub catalog: Arc<dyn Catalog>,
    /// Discovery notifications for whoever subscribes
    pub events: broadcast::Sender<DiscoveryEvent>,
}

impl AppState {
    /// Production wiring: one HTTP client behind both the adapters and the
    /// page fetcher, and the SQLite-backed catalog.
    pub fn new(config: Config, conn: rusqlite::Connection) -> Result<Self, reqwest::Error> {
        let client = Arc::new(config.http.create_http_client()?);
        let adapters = Arc::new(SiteAdapters::new(client.clone(), &config.mangadex_api_url));
        let fetcher: Arc<dyn PageFetcher> = client.clone();
        Ok(Self::with_parts(
            config,
            conn,
            client,
            adapters,
            fetcher,
            Arc::new(SqliteCatalog),
        ))
    }

    /// Wiring with explicit collaborators, used to swap in fakes.
    pub fn with_parts(
        config: Config,
        conn: rusqlite::Connection,
        client: Arc<EnhancedHttpClient>,
        adapters: Arc<dyn AdapterSet>,
        fetcher: Arc<dyn PageFetcher>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        let db: SharedConnection = Arc::new(Mutex::new(conn));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings: SettingsStore::new(db.clone()),
            db,
            client,
            metrics: MetricsTracker::new(),
            config,
            adapters,
            fetcher,
            catalog,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Create tables and seed settings.
    pub fn prepare_database(&self) -> rusqlite::Result<()> {
        {
            let conn = db::lock(&self.db);
            db::create_tables(&conn)?;
        }
        self.settings.seed_defaults()
    }
}
