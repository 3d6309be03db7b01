//! Heuristic adapter for sites without a known template.
//!
//! Page extraction picks the content container holding the most images,
//! drops decorative images, orders what is left and, when too little was
//! found, falls back to image URLs embedded in inline scripts.

use crate::error::AdapterError;
use crate::helpers::{extract_chapter_number, extract_number};
use crate::http_client::EnhancedHttpClient;
use crate::models::ChapterDescriptor;
use crate::source_utils::{element_text, image_source, is_placeholder, resolve_url, LAZY_ATTRS};
use crate::sources::{finalize_listing, ExtractOptions, SiteAdapter};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

const CONTAINER_SELECTORS: &[&str] = &[
    ".chapter-content",
    ".reading-content",
    ".chapter-images",
    ".manga-images",
    ".reader-content",
    ".chapter-body",
    ".pages",
    "#chapter-content",
    "#reading-content",
    "#readerarea",
    "#pages",
    "[class*='chapter'][class*='content']",
    "[class*='reading'][class*='content']",
    "[class*='page'][class*='container']",
    ".content",
    "article",
    "main",
];

/// Matched against URL path, class and id tokens. Keywords of four or more
/// letters also match as a token prefix (`logos`, `banner728`).
const DECORATIVE_KEYWORDS: &[&str] = &[
    "logo", "banner", "ad", "ads", "advert", "advertisement", "sponsor", "avatar", "icon", "button",
    "bg", "background", "thumb", "thumbnail", "preview", "cover", "header", "footer", "nav",
    "navbar", "menu", "sidebar", "widget", "comment", "user", "profile", "social", "share",
    "sprite", "emoji", "badge",
];

/// DOM attributes that may carry a page index, in priority order.
const ORDER_ATTRS: &[&str] = &["data-page", "data-index", "data-order", "id"];

static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").expect("img selector"));
static SCRIPT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script").expect("script selector"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

static URL_ORDINAL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/page[_-]?(\d+)",
        r"(?i)/(\d+)\.(?:jpe?g|png|gif|webp|bmp|avif)$",
        r"(?i)[_-](\d+)\.(?:jpe?g|png|gif|webp|bmp|avif)$",
        r"(?i)p(\d+)\.",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("url ordinal regex"))
    .collect()
});

static FIRST_INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("int regex"));

static SCRIPT_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']((?:https?:)?//[^"'\s]+?\.(?:jpe?g|png|gif|webp|avif)(?:\?[^"'\s]*)?|/[^"'\s]+?\.(?:jpe?g|png|gif|webp|avif)(?:\?[^"'\s]*)?)["']"#)
        .expect("script image regex")
});

/// How a chapter's page order was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStrategy {
    UrlOrdinal,
    DomAttribute,
    DocumentOrder,
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    url: String,
    url_ordinal: Option<u32>,
    attr_ordinal: Option<u32>,
}

pub fn is_decorative_text(text: &str) -> bool {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .any(|token| {
            DECORATIVE_KEYWORDS
                .iter()
                .any(|kw| token == *kw || (kw.len() >= 4 && token.starts_with(kw)))
        })
}

/// Last path segment of an image URL. Directories often carry the series
/// slug, which must not be mistaken for a decoration keyword.
fn file_name(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    path.rsplit('/').next().unwrap_or_default().to_string()
}

fn is_decorative(img: &ElementRef<'_>, url: &str) -> bool {
    let el = img.value();
    let class_and_id = format!(
        "{} {}",
        el.attr("class").unwrap_or_default(),
        el.attr("id").unwrap_or_default()
    );
    is_decorative_text(&file_name(url)) || is_decorative_text(&class_and_id)
}

/// Declared dimensions too small for a manga page.
fn below_size_hint(img: &ElementRef<'_>) -> bool {
    let dim = |name| {
        img.value()
            .attr(name)
            .and_then(|v| v.trim().trim_end_matches("px").parse::<u32>().ok())
    };
    match (dim("width"), dim("height")) {
        (Some(w), Some(h)) => w < 200 || h < 200 || (w == h && w < 300),
        _ => false,
    }
}

/// Page number encoded in the file name, e.g. `page-3.jpg`, `/07.png`, `p12.webp`.
pub fn url_ordinal(url: &str) -> Option<u32> {
    let last = format!("/{}", file_name(url));
    URL_ORDINAL_RES
        .iter()
        .find_map(|re| re.captures(&last))
        .and_then(|cap| cap[1].parse().ok())
}

fn attr_ordinal(img: &ElementRef<'_>) -> Option<u32> {
    ORDER_ATTRS.iter().find_map(|attr| {
        let value = img.value().attr(attr)?;
        let n: u32 = FIRST_INT_RE.find(value)?.as_str().parse().ok()?;
        (n < 1000).then_some(n)
    })
}

/// The container with the most `<img>` descendants; the whole document if
/// no known container has any.
fn content_container(document: &Html) -> ElementRef<'_> {
    let mut best: Option<(ElementRef<'_>, usize)> = None;
    for sel in CONTAINER_SELECTORS {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        for el in document.select(&selector) {
            let count = el.select(&IMG).count();
            if count > 0 && best.as_ref().map_or(true, |(_, c)| count > *c) {
                best = Some((el, count));
            }
        }
    }
    best.map(|(el, _)| el).unwrap_or_else(|| document.root_element())
}

fn collect_candidates(container: ElementRef<'_>, base: &str, options: &ExtractOptions) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for img in container.select(&IMG) {
        let Some(url) = image_source(&img, LAZY_ATTRS).and_then(|src| resolve_url(base, &src)) else {
            continue;
        };
        if is_placeholder(&url) {
            continue;
        }
        if options.decorative_filter && (is_decorative(&img, &url) || below_size_hint(&img)) {
            log::debug!("Skipping decorative image {}", url);
            continue;
        }
        if !seen.insert(url.clone()) {
            continue;
        }
        out.push(Candidate {
            url_ordinal: url_ordinal(&url),
            attr_ordinal: attr_ordinal(&img),
            url,
        });
    }
    out
}

/// Order by URL ordinal if every image has one, else by DOM attribute if
/// every image has one, else keep document order. Sorting is stable so equal
/// ordinals keep their document order.
fn order_candidates(mut candidates: Vec<Candidate>) -> (Vec<Candidate>, OrderStrategy) {
    if candidates.is_empty() {
        return (candidates, OrderStrategy::DocumentOrder);
    }
    if candidates.iter().all(|c| c.url_ordinal.is_some()) {
        candidates.sort_by_key(|c| c.url_ordinal);
        (candidates, OrderStrategy::UrlOrdinal)
    } else if candidates.iter().all(|c| c.attr_ordinal.is_some()) {
        candidates.sort_by_key(|c| c.attr_ordinal);
        (candidates, OrderStrategy::DomAttribute)
    } else {
        (candidates, OrderStrategy::DocumentOrder)
    }
}

/// Image URLs found in inline script payloads (JSON arrays, `var pages = [...]`).
pub fn script_images(document: &Html, base: &str, options: &ExtractOptions) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for script in document.select(&SCRIPT) {
        let text = script.text().collect::<String>().replace("\\/", "/");
        for cap in SCRIPT_IMAGE_RE.captures_iter(&text) {
            let raw = &cap[1];
            if is_placeholder(raw) {
                continue;
            }
            let Some(url) = resolve_url(base, raw) else { continue };
            if options.decorative_filter && is_decorative_text(&file_name(&url)) {
                continue;
            }
            if seen.insert(url.clone()) {
                out.push(url);
            }
        }
    }
    out
}

/// Full page extraction for one chapter document.
pub fn extract_pages(html: &str, chapter_url: &str, options: &ExtractOptions) -> (Vec<String>, OrderStrategy) {
    let document = Html::parse_document(html);
    let container = content_container(&document);
    let (ordered, strategy) = order_candidates(collect_candidates(container, chapter_url, options));
    let mut pages: Vec<String> = ordered.into_iter().map(|c| c.url).collect();

    if pages.len() < options.min_page_count {
        let mut seen: HashSet<String> = pages.iter().cloned().collect();
        let extra: Vec<String> = script_images(&document, chapter_url, options)
            .into_iter()
            .filter(|u| seen.insert(u.clone()))
            .collect();
        if !extra.is_empty() {
            log::debug!("Script scan added {} images for {}", extra.len(), chapter_url);
            pages.extend(extra);
        }
    }
    (pages, strategy)
}

/// Chapter links on an arbitrary series page.
pub fn parse_listing(html: &str, listing_url: &str) -> Vec<ChapterDescriptor> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHOR)
        .filter_map(|a| {
            let text = element_text(&a);
            let lower = text.to_lowercase();
            if !["chapter", "ch.", "cap"].iter().any(|k| lower.contains(k)) {
                return None;
            }
            let number = extract_chapter_number(&text).or_else(|| extract_number(&text))?;
            let url = resolve_url(listing_url, a.value().attr("href")?)?;
            if url == listing_url {
                return None;
            }
            Some(ChapterDescriptor {
                number,
                title: Some(text),
                url,
            })
        })
        .collect()
}

pub struct GenericAdapter {
    client: Arc<EnhancedHttpClient>,
}

impl GenericAdapter {
    pub fn new(client: Arc<EnhancedHttpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SiteAdapter for GenericAdapter {
    async fn list_chapters(&self, listing_url: &str) -> Result<Vec<ChapterDescriptor>, AdapterError> {
        let html = self.client.get_text(listing_url).await?;
        let chapters = parse_listing(&html, listing_url);
        if chapters.is_empty() {
            return Err(AdapterError::Structure(format!(
                "no chapter links found at {}",
                listing_url
            )));
        }
        Ok(finalize_listing(chapters))
    }

    async fn list_pages(
        &self,
        chapter_url: &str,
        options: &ExtractOptions,
    ) -> Result<Vec<String>, AdapterError> {
        let html = self.client.get_text(chapter_url).await?;
        let (pages, strategy) = extract_pages(&html, chapter_url, options);
        if pages.is_empty() {
            return Err(AdapterError::Structure(format!(
                "no page images found at {}",
                chapter_url
            )));
        }
        log::debug!("{} pages at {} ordered by {:?}", pages.len(), chapter_url, strategy);
        Ok(pages)
    }
}
