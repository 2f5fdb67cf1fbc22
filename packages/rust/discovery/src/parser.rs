//! Listing parsers: sitemap indexes, sitemaps, RSS/Atom feeds and paginated
//! HTML listings.
//!
//! Sitemaps and feeds are scanned with tolerant regexes rather than a strict
//! XML parser; government listings are frequently malformed.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use regtruth_shared::{ChangeFrequency, RegTruthError, Result};
use scraper::{Html, Selector};
use url::Url;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One candidate document URL found in a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub url: String,
    /// `<lastmod>` / `<pubDate>` / `<updated>`, when the listing carries one.
    pub published: Option<NaiveDate>,
    pub change_frequency: ChangeFrequency,
}

impl ListingEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            published: None,
            change_frequency: ChangeFrequency::Unknown,
        }
    }

    /// Undated entries always pass; dated ones must fall inside the range.
    pub fn within(&self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
        match self.published {
            None => true,
            Some(d) => from.is_none_or(|f| d >= f) && to.is_none_or(|t| d <= t),
        }
    }
}

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq)]
pub enum Sitemap {
    /// `<sitemapindex>`: URLs of child sitemaps.
    Index(Vec<String>),
    /// `<urlset>`: document entries.
    UrlSet(Vec<ListingEntry>),
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static SITEMAP_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<sitemap\b[^>]*>(.*?)</sitemap>").expect("sitemap regex"));

static URL_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<url\b[^>]*>(.*?)</url>").expect("url regex"));

static ITEM_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<item\b[^>]*>(.*?)</item>").expect("item regex"));

static ENTRY_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<entry\b[^>]*>(.*?)</entry>").expect("entry regex"));

static ATOM_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<link\b[^>]*\bhref\s*=\s*["']([^"']+)["'][^>]*>"#).expect("atom link regex")
});

static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^<!\[CDATA\[(.*)\]\]>$").expect("cdata regex"));

/// Text content of the first `<tag>...</tag>` in `block`.
fn tag_text(block: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?is)<{tag}\b[^>]*>(.*?)</{tag}>")).ok()?;
    let raw = re.captures(block)?.get(1)?.as_str().trim();
    let raw = CDATA_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map_or(raw, |m| m.as_str())
        .trim();
    if raw.is_empty() {
        None
    } else {
        Some(unescape_xml(raw))
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Parse the date formats listings use: W3C datetime, bare dates, RFC 2822.
pub fn parse_listing_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

/// Parse a sitemap or sitemap index.
pub fn parse_sitemap(xml: &str) -> Result<Sitemap> {
    let lower = xml.to_ascii_lowercase();

    if lower.contains("<sitemapindex") {
        let children = SITEMAP_BLOCK_RE
            .captures_iter(xml)
            .filter_map(|c| tag_text(&c[1], "loc"))
            .collect();
        return Ok(Sitemap::Index(children));
    }

    if lower.contains("<urlset") {
        let entries = URL_BLOCK_RE
            .captures_iter(xml)
            .filter_map(|c| {
                let block = &c[1];
                let mut entry = ListingEntry::new(tag_text(block, "loc")?);
                entry.published = tag_text(block, "lastmod").and_then(|d| parse_listing_date(&d));
                entry.change_frequency = tag_text(block, "changefreq")
                    .map(|f| ChangeFrequency::from_listing(&f))
                    .unwrap_or(ChangeFrequency::Unknown);
                Some(entry)
            })
            .collect();
        return Ok(Sitemap::UrlSet(entries));
    }

    Err(RegTruthError::parse(
        "document is neither a <sitemapindex> nor a <urlset>",
    ))
}

/// Parse an RSS 2.0 or Atom feed.
pub fn parse_feed(xml: &str) -> Result<Vec<ListingEntry>> {
    let lower = xml.to_ascii_lowercase();

    if lower.contains("<rss") || lower.contains("<channel") {
        let entries = ITEM_BLOCK_RE
            .captures_iter(xml)
            .filter_map(|c| {
                let block = &c[1];
                let link = tag_text(block, "link").or_else(|| tag_text(block, "guid"))?;
                let mut entry = ListingEntry::new(link);
                entry.published = tag_text(block, "pubDate")
                    .or_else(|| tag_text(block, "dc:date"))
                    .and_then(|d| parse_listing_date(&d));
                Some(entry)
            })
            .collect();
        return Ok(entries);
    }

    if lower.contains("<feed") {
        let entries = ENTRY_BLOCK_RE
            .captures_iter(xml)
            .filter_map(|c| {
                let block = &c[1];
                let link = ATOM_LINK_RE.captures(block)?.get(1)?.as_str();
                let mut entry = ListingEntry::new(unescape_xml(link));
                entry.published = tag_text(block, "updated")
                    .or_else(|| tag_text(block, "published"))
                    .and_then(|d| parse_listing_date(&d));
                Some(entry)
            })
            .collect();
        return Ok(entries);
    }

    Err(RegTruthError::parse("document is not an RSS or Atom feed"))
}

/// Document links on an HTML listing page.
///
/// With a `link_pattern`, only absolute URLs matching it are kept; otherwise
/// any link on the listing's own host is a candidate.
pub fn parse_html_links(html: &str, base: &Url, link_pattern: Option<&Regex>) -> Vec<ListingEntry> {
    let doc = Html::parse_document(html);
    let link_sel = Selector::parse("a[href]").expect("valid selector");
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for el in doc.select(&link_sel) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("javascript:") || href.starts_with("mailto:") {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }

        let keep = match link_pattern {
            Some(re) => re.is_match(resolved.as_str()),
            None => resolved.host_str() == base.host_str() && resolved.path() != base.path(),
        };
        if keep && seen.insert(resolved.to_string()) {
            entries.push(ListingEntry::new(resolved.to_string()));
        }
    }
    entries
}
