//! Adapters for sites built on a known reader template. Each family is a
//! `TemplateProfile` naming its chapter-list and reader selectors.

use crate::error::AdapterError;
use crate::helpers::{extract_chapter_number, extract_chapter_number_from_url};
use crate::http_client::EnhancedHttpClient;
use crate::models::ChapterDescriptor;
use crate::source_utils::{element_text, images_by_selectors, resolve_url};
use crate::sources::{finalize_listing, ExtractOptions, SiteAdapter};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use std::sync::{Arc, LazyLock};

#[derive(Debug, Clone, Copy)]
pub struct TemplateProfile {
    pub name: &'static str,
    /// Tried in order; the first selector matching any anchor wins.
    pub chapter_list_selectors: &'static [&'static str],
    pub reader_selectors: &'static [&'static str],
    /// Madara themes may load the chapter list over admin-ajax.
    pub ajax_chapter_list: bool,
}

pub const MANGANELO: TemplateProfile = TemplateProfile {
    name: "manganelo",
    chapter_list_selectors: &[
        "ul.row-content-chapter li a.chapter-name",
        "ul.row-content-chapter li a",
        "div.panel-story-chapter-list a",
        "a[href*='/chapter']",
    ],
    reader_selectors: &["div.container-chapter-reader img", "div.chapter-content img"],
    ajax_chapter_list: false,
};

pub const MANGAKAKALOT: TemplateProfile = TemplateProfile {
    name: "mangakakalot",
    chapter_list_selectors: &[
        "div.chapter-list div.row span a",
        "div.chapter-list a",
        "a[href*='/chapter']",
    ],
    reader_selectors: &[
        "div.container-chapter-reader img",
        "div#vungdoc img",
        "div.vung-doc img",
    ],
    ajax_chapter_list: false,
};

pub const MADARA: TemplateProfile = TemplateProfile {
    name: "madara",
    chapter_list_selectors: &[
        "li.wp-manga-chapter a",
        "ul.main.version-chap li a",
        "div.listing-chapters_wrap a",
        "div.eplister a",
        "div#chapterlist a",
        "ul.clstyle a",
        "div.page-content-listing a[href*='chapter']",
    ],
    reader_selectors: &[
        "div.reading-content img",
        "div.page-break img",
        "div#readerarea img",
        "div.entry-content img",
    ],
    ajax_chapter_list: true,
};

static MANGA_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"manga_id\s*=\s*(\d+)").expect("manga id regex"));

pub struct TemplateAdapter {
    client: Arc<EnhancedHttpClient>,
    profile: TemplateProfile,
}

impl TemplateAdapter {
    pub fn new(client: Arc<EnhancedHttpClient>, profile: TemplateProfile) -> Self {
        Self { client, profile }
    }

    /// Madara fallback: newer themes serve `<series>/ajax/chapters/`, older
    /// ones answer `admin-ajax.php?action=manga_get_chapters`.
    async fn fetch_ajax_chapter_list(&self, listing_url: &str, html: &str) -> Result<Option<String>, AdapterError> {
        let post_id = find_post_id(html);
        let series = listing_url.trim_end_matches('/');
        let http = self.client.client();

        let response = http
            .post(format!("{}/ajax/chapters/", series))
            .timeout(self.client.request_timeout())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(Some(response.text().await?));
        }

        let (Some(pid), Ok(url)) = (post_id, Url::parse(listing_url)) else {
            return Ok(None);
        };
        let ajax = format!("{}://{}/wp-admin/admin-ajax.php", url.scheme(), url.host_str().unwrap_or_default());
        let response = http
            .post(&ajax)
            .timeout(self.client.request_timeout())
            .form(&[("action", "manga_get_chapters"), ("manga", pid.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(Some(response.text().await?))
    }
}

fn find_post_id(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    if let Ok(sel) = Selector::parse("div#manga-chapters-holder") {
        if let Some(id) = document
            .select(&sel)
            .next()
            .and_then(|div| div.value().attr("data-id"))
        {
            return Some(id.to_string());
        }
    }
    MANGA_ID_RE.captures(html).map(|cap| cap[1].to_string())
}

/// Parse a chapter list. `None` means no selector yielded a numbered chapter,
/// which the caller reports as an unrecognised page.
pub fn parse_chapter_list(
    html: &str,
    base_url: &str,
    selectors: &[&str],
) -> Option<Vec<ChapterDescriptor>> {
    let document = Html::parse_document(html);
    for sel in selectors {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        let anchors: Vec<_> = document.select(&selector).collect();
        if anchors.is_empty() {
            continue;
        }
        let chapters: Vec<ChapterDescriptor> = anchors
            .iter()
            .filter_map(|a| {
                let href = a.value().attr("href").or_else(|| a.value().attr("data-href"))?;
                let url = resolve_url(base_url, href)?;
                let text = element_text(a);
                let number = extract_chapter_number(&text).or_else(|| extract_chapter_number_from_url(&url))?;
                let title = (!text.is_empty()).then_some(text);
                Some(ChapterDescriptor { number, title, url })
            })
            .collect();
        if chapters.is_empty() {
            log::debug!("Selector {} matched {} links without chapter numbers", sel, anchors.len());
            continue;
        }
        log::debug!("Found {} chapters using selector: {}", chapters.len(), sel);
        return Some(chapters);
    }
    None
}

fn non_empty_listing(chapters: Option<Vec<ChapterDescriptor>>) -> Option<Vec<ChapterDescriptor>> {
    chapters.map(finalize_listing).filter(|c| !c.is_empty())
}

#[async_trait]
impl SiteAdapter for TemplateAdapter {
    async fn list_chapters(&self, listing_url: &str) -> Result<Vec<ChapterDescriptor>, AdapterError> {
        let html = self.client.get_text(listing_url).await?;
        if let Some(chapters) = non_empty_listing(parse_chapter_list(&html, listing_url, self.profile.chapter_list_selectors)) {
            return Ok(chapters);
        }

        if self.profile.ajax_chapter_list {
            if let Some(fragment) = self.fetch_ajax_chapter_list(listing_url, &html).await? {
                if let Some(chapters) = non_empty_listing(parse_chapter_list(&fragment, listing_url, &["a"])) {
                    return Ok(chapters);
                }
            }
        }

        Err(AdapterError::Structure(format!(
            "{}: chapter list not found at {}",
            self.profile.name, listing_url
        )))
    }

    async fn list_pages(
        &self,
        chapter_url: &str,
        _options: &ExtractOptions,
    ) -> Result<Vec<String>, AdapterError> {
        let html = self.client.get_text(chapter_url).await?;
        let document = Html::parse_document(&html);
        let pages = images_by_selectors(&document, self.profile.reader_selectors, chapter_url);
        if pages.is_empty() {
            return Err(AdapterError::Structure(format!(
                "{}: reader container not found at {}",
                self.profile.name, chapter_url
            )));
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANGANELO_LISTING: &str = r#"
        <html><body>
        <div class="panel-story-chapter-list">
          <ul class="row-content-chapter">
            <li><a class="chapter-name" href="https://chapmanganelo.example/manga-ab/chapter-3">Chapter 3: Rain</a></li>
            <li><a class="chapter-name" href="https://chapmanganelo.example/manga-ab/chapter-2.5">Chapter 2.5</a></li>
            <li><a class="chapter-name" href="/manga-ab/chapter-2">Chapter 2</a></li>
            <li><a class="chapter-name" href="/manga-ab/chapter-1">Vol.1 Chapter 1</a></li>
          </ul>
        </div>
        </body></html>"#;

    #[test]
    fn manganelo_listing() {
        let chapters = parse_chapter_list(
            MANGANELO_LISTING,
            "https://chapmanganelo.example/manga-ab",
            MANGANELO.chapter_list_selectors,
        )
        .unwrap();
        let listing = finalize_listing(chapters);
        let numbers: Vec<f64> = listing.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1.0, 2.0, 2.5, 3.0]);
        assert_eq!(listing[1].url, "https://chapmanganelo.example/manga-ab/chapter-2");
        assert_eq!(listing[3].title.as_deref(), Some("Chapter 3: Rain"));
    }

    #[test]
    fn madara_number_from_url_when_text_is_a_date() {
        let html = r#"<ul class="main version-chap">
            <li class="wp-manga-chapter"><a href="https://scans.example/manga/foo/chapter-12-5/">12.5 - Jan 3</a></li>
        </ul>"#;
        let chapters = parse_chapter_list(html, "https://scans.example/manga/foo/", MADARA.chapter_list_selectors).unwrap();
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].number, 12.5);
    }

    #[test]
    fn missing_list_is_none() {
        let html = "<html><body><p>Maintenance</p></body></html>";
        assert!(parse_chapter_list(html, "https://x.example/", MANGAKAKALOT.chapter_list_selectors).is_none());
    }

    #[test]
    fn links_without_numbers_are_not_a_listing() {
        let html = r#"<div class="chapter-list">
            <div class="row"><span><a href="/chapter/latest">Read latest</a></span></div>
            <div class="row"><span><a href="/chapter/first">Read first</a></span></div>
        </div>"#;
        assert!(parse_chapter_list(html, "https://x.example/manga/foo", MANGAKAKALOT.chapter_list_selectors).is_none());
        assert!(non_empty_listing(Some(vec![ChapterDescriptor {
            number: -1.0,
            title: None,
            url: "https://x.example/manga/foo/chapter/-1".into(),
        }]))
        .is_none());
    }

    #[test]
    fn madara_reader_prefers_lazy_sources() {
        let html = r#"<div class="reading-content">
            <div class="page-break"><img src="data:image/svg+xml;base64,AAA" data-src="https://cdn.example/foo/01.jpg"></div>
            <div class="page-break"><img data-lazy-src="https://cdn.example/foo/02.jpg"></div>
            <div class="page-break"><img src="https://cdn.example/foo/03.jpg"></div>
        </div>"#;
        let document = Html::parse_document(html);
        let pages = images_by_selectors(&document, MADARA.reader_selectors, "https://scans.example/manga/foo/chapter-1/");
        assert_eq!(
            pages,
            vec![
                "https://cdn.example/foo/01.jpg",
                "https://cdn.example/foo/02.jpg",
                "https://cdn.example/foo/03.jpg"
            ]
        );
    }

    #[test]
    fn post_id_from_holder_or_script() {
        assert_eq!(
            find_post_id(r#"<div id="manga-chapters-holder" data-id="981"></div>"#).as_deref(),
            Some("981")
        );
        assert_eq!(
            find_post_id("<script>var manga_id = 42;</script>").as_deref(),
            Some("42")
        );
    }
}
