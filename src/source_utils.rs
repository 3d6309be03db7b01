//! HTML helpers shared by the template and generic adapters.

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

/// Lazy-load attributes checked after `src`, in priority order.
pub const LAZY_ATTRS: &[&str] = &[
    "data-src",
    "data-original",
    "data-lazy-src",
    "data-srcset",
    "data-echo",
    "data-url",
];

const PLACEHOLDER_MARKERS: &[&str] = &["data:image", "placeholder", "loading", "spinner", "blank"];

/// Resolve `href` against `base`; returns `None` for unusable links.
pub fn resolve_url(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    if href.starts_with("data:") {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

/// URLs that are lazy-load stand-ins rather than real page images.
pub fn is_placeholder(url: &str) -> bool {
    let lower = url.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

/// First usable image URL on an element: `src`, then the lazy attributes.
/// A `src` holding a placeholder is skipped in favour of the lazy value.
pub fn image_source(img: &ElementRef<'_>, attrs: &[&str]) -> Option<String> {
    let el = img.value();
    for attr in std::iter::once(&"src").chain(attrs.iter()) {
        let Some(raw) = el.attr(attr) else { continue };
        // srcset-style values: keep the first candidate
        let candidate = raw.split_whitespace().next().unwrap_or("").trim_end_matches(',');
        if candidate.is_empty() || is_placeholder(candidate) {
            continue;
        }
        return Some(candidate.to_string());
    }
    None
}

pub fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Image URLs under the first selector that yields any, resolved and
/// de-duplicated in document order.
pub fn images_by_selectors(document: &Html, selectors: &[&str], base: &str) -> Vec<String> {
    for sel in selectors {
        let Ok(selector) = Selector::parse(sel) else {
            log::warn!("Invalid selector {}", sel);
            continue;
        };
        let mut seen = HashSet::new();
        let urls: Vec<String> = document
            .select(&selector)
            .filter_map(|img| image_source(&img, LAZY_ATTRS))
            .filter_map(|src| resolve_url(base, &src))
            .filter(|url| seen.insert(url.clone()))
            .collect();
        if !urls.is_empty() {
            log::debug!("Found {} images using selector: {}", urls.len(), sel);
            return urls;
        }
    }
    Vec::new()
}
