//! Site Adapter Set.
//!
//! One adapter per site family behind a single capability trait. Adding a
//! family means adding a variant to `SiteFamily` and an adapter here; the
//! scheduler and processor only ever see `dyn SiteAdapter`.

pub mod generic;
pub mod mangadex;
pub mod template;

use crate::error::AdapterError;
use crate::http_client::EnhancedHttpClient;
use crate::models::{ChapterDescriptor, SiteFamily};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Per-call knobs taken from the Settings Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub decorative_filter: bool,
    /// Below this many pages the generic adapter also scans inline scripts.
    pub min_page_count: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            decorative_filter: true,
            min_page_count: 3,
        }
    }
}

#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Every chapter the listing page exposes, ascending by number.
    async fn list_chapters(&self, listing_url: &str) -> Result<Vec<ChapterDescriptor>, AdapterError>;

    /// Absolute page image URLs in final reading order. Callers never re-sort.
    async fn list_pages(
        &self,
        chapter_url: &str,
        options: &ExtractOptions,
    ) -> Result<Vec<String>, AdapterError>;
}

/// Lookup from site family to adapter. `None` is a configuration error.
pub trait AdapterSet: Send + Sync {
    fn adapter(&self, family: SiteFamily) -> Option<&dyn SiteAdapter>;
}

/// The production adapter set, all sharing one HTTP client.
pub struct SiteAdapters {
    mangadex: mangadex::MangaDexAdapter,
    manganelo: template::TemplateAdapter,
    mangakakalot: template::TemplateAdapter,
    madara: template::TemplateAdapter,
    generic: generic::GenericAdapter,
}

impl SiteAdapters {
    pub fn new(client: Arc<EnhancedHttpClient>, mangadex_api_url: &str) -> Self {
        Self {
            mangadex: mangadex::MangaDexAdapter::new(client.clone(), mangadex_api_url),
            manganelo: template::TemplateAdapter::new(client.clone(), template::MANGANELO),
            mangakakalot: template::TemplateAdapter::new(client.clone(), template::MANGAKAKALOT),
            madara: template::TemplateAdapter::new(client.clone(), template::MADARA),
            generic: generic::GenericAdapter::new(client),
        }
    }
}

impl AdapterSet for SiteAdapters {
    fn adapter(&self, family: SiteFamily) -> Option<&dyn SiteAdapter> {
        let adapter: &dyn SiteAdapter = match family {
            SiteFamily::MangaDex => &self.mangadex,
            SiteFamily::Manganelo => &self.manganelo,
            SiteFamily::Mangakakalot => &self.mangakakalot,
            SiteFamily::Madara => &self.madara,
            SiteFamily::Generic => &self.generic,
        };
        Some(adapter)
    }
}

/// Drop non-finite numbers and repeated chapter numbers (first wins), then
/// sort ascending.
pub fn finalize_listing(chapters: Vec<ChapterDescriptor>) -> Vec<ChapterDescriptor> {
    let mut seen = HashSet::new();
    let mut out: Vec<ChapterDescriptor> = chapters
        .into_iter()
        .filter(|c| c.number.is_finite() && c.number >= 0.0)
        .filter(|c| seen.insert(c.number.to_bits()))
        .collect();
    out.sort_by(|a, b| a.number.total_cmp(&b.number));
    out
}
