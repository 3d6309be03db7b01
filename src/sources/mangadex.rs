use crate::error::AdapterError;
use crate::helpers::extract_number;
use crate::http_client::EnhancedHttpClient;
use crate::models::ChapterDescriptor;
use crate::sources::{finalize_listing, ExtractOptions, SiteAdapter};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

pub const BASE_URL: &str = "https://api.mangadex.org";
const SITE_URL: &str = "https://mangadex.org";
const FEED_LIMIT: usize = 100;
/// Hard stop on feed pagination in case `total` is wrong.
const MAX_FEED_PAGES: usize = 50;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(?:title|manga|chapter)/([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
        .expect("mangadex uuid regex")
});

#[derive(Deserialize)]
struct FeedResponse {
    data: Vec<FeedChapter>,
    #[serde(default)]
    total: usize,
}

#[derive(Deserialize)]
struct FeedChapter {
    id: String,
    attributes: ChapterAttributes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    /// Chapters hosted off-site have no pages on the image servers.
    external_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeResponse {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Deserialize)]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
}

/// MangaDex API adapter: the chapter feed for listings and the at-home
/// image servers for pages.
pub struct MangaDexAdapter {
    client: Arc<EnhancedHttpClient>,
    api_url: String,
}

impl MangaDexAdapter {
    pub fn new(client: Arc<EnhancedHttpClient>, api_url: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn feed_url(&self, manga_id: &str, offset: usize) -> String {
        format!(
            "{}/manga/{}/feed?limit={}&offset={}&translatedLanguage[]=en&order[chapter]=asc",
            self.api_url, manga_id, FEED_LIMIT, offset
        )
    }
}

pub fn extract_id(url: &str) -> Option<String> {
    UUID_RE
        .captures(url)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_lowercase())
}

fn parse_feed(body: &str) -> Result<(Vec<ChapterDescriptor>, usize, usize), AdapterError> {
    let feed: FeedResponse = serde_json::from_str(body)?;
    let returned = feed.data.len();
    let chapters = feed
        .data
        .into_iter()
        .filter(|c| c.attributes.external_url.is_none())
        .filter_map(|c| {
            let number = c.attributes.chapter.as_deref().and_then(extract_number)?;
            let title = c.attributes.title.filter(|t| !t.trim().is_empty());
            Some(ChapterDescriptor {
                number,
                title,
                url: format!("{}/chapter/{}", SITE_URL, c.id),
            })
        })
        .collect();
    Ok((chapters, returned, feed.total))
}

fn parse_at_home(body: &str) -> Result<Vec<String>, AdapterError> {
    let at_home: AtHomeResponse = serde_json::from_str(body)?;
    let base = at_home.base_url.trim_end_matches('/');
    Ok(at_home
        .chapter
        .data
        .iter()
        .map(|file| format!("{}/data/{}/{}", base, at_home.chapter.hash, file))
        .collect())
}

#[async_trait]
impl SiteAdapter for MangaDexAdapter {
    async fn list_chapters(&self, listing_url: &str) -> Result<Vec<ChapterDescriptor>, AdapterError> {
        let manga_id = extract_id(listing_url).ok_or_else(|| {
            AdapterError::Structure(format!("no MangaDex title id in {}", listing_url))
        })?;

        let mut out = Vec::new();
        let mut offset = 0usize;
        for _ in 0..MAX_FEED_PAGES {
            let body = self.client.get_text(&self.feed_url(&manga_id, offset)).await?;
            let (chapters, returned, total) = parse_feed(&body)?;
            out.extend(chapters);
            offset += returned;
            if returned == 0 || offset >= total {
                break;
            }
        }
        log::debug!("MangaDex {}: {} chapters in feed", manga_id, out.len());
        Ok(finalize_listing(out))
    }

    async fn list_pages(
        &self,
        chapter_url: &str,
        _options: &ExtractOptions,
    ) -> Result<Vec<String>, AdapterError> {
        let chapter_id = extract_id(chapter_url).ok_or_else(|| {
            AdapterError::Structure(format!("no MangaDex chapter id in {}", chapter_url))
        })?;
        let body = self
            .client
            .get_text(&format!("{}/at-home/server/{}", self.api_url, chapter_id))
            .await?;
        let pages = parse_at_home(&body)?;
        if pages.is_empty() {
            return Err(AdapterError::Structure(format!(
                "MangaDex chapter {} has no pages",
                chapter_id
            )));
        }
        Ok(pages)
    }
}
