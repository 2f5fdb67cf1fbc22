//! Listing traversal shared by both producers.
//!
//! A listing is walked one document at a time: each [`ListingTarget`] read
//! yields candidate entries plus the follow-up targets it implies (child
//! sitemaps, the next page). Callers drive the loop, which is where
//! cancellation checks and per-page accounting happen.

use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use regtruth_crawler::Fetcher;
use regtruth_shared::{BackfillMode, ListingKind, RegTruthError, Result, SourceConfig};
use tracing::debug;
use url::Url;

use crate::parser::{ListingEntry, Sitemap, parse_feed, parse_html_links, parse_sitemap};

/// Sitemap indexes nested deeper than this are not followed.
const MAX_SITEMAP_DEPTH: u32 = 3;

/// One listing document to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingTarget {
    Sitemap { url: String, depth: u32 },
    Feed { url: String },
    /// A page of an HTML listing. `template` may contain `{page}`.
    Page { template: String, page: u32, max_pages: u32 },
}

impl ListingTarget {
    pub fn url(&self) -> String {
        match self {
            Self::Sitemap { url, .. } | Self::Feed { url } => url.clone(),
            Self::Page { template, page, .. } => template.replace("{page}", &page.to_string()),
        }
    }

    /// Depth of the documents this target lists, relative to the source root.
    pub fn crawl_depth(&self) -> u32 {
        match self {
            Self::Sitemap { depth, .. } => *depth,
            Self::Feed { .. } => 0,
            Self::Page { page, .. } => page.saturating_sub(1),
        }
    }

    pub fn is_page(&self) -> bool {
        matches!(self, Self::Page { .. })
    }

    fn next_page(&self) -> Option<Self> {
        match self {
            Self::Page {
                template,
                page,
                max_pages,
            } if template.contains("{page}") && page < max_pages => Some(Self::Page {
                template: template.clone(),
                page: page + 1,
                max_pages: *max_pages,
            }),
            _ => None,
        }
    }
}

/// Entry points of a source's regular (forward) listing.
pub fn scheduled_targets(source: &SourceConfig) -> Vec<ListingTarget> {
    match source.listing {
        ListingKind::Sitemap => vec![ListingTarget::Sitemap {
            url: source.listing_url.clone(),
            depth: 0,
        }],
        ListingKind::Rss => vec![ListingTarget::Feed {
            url: source.listing_url.clone(),
        }],
        ListingKind::Pagination => vec![ListingTarget::Page {
            template: source
                .pagination_template
                .clone()
                .unwrap_or_else(|| source.listing_url.clone()),
            page: 1,
            max_pages: source.max_pages.max(1),
        }],
    }
}

/// Entry points of a historical crawl in `mode`.
///
/// ARCHIVE expands the archive template once per year in
/// `[date_from, date_to]`, with `today` bounding open ranges.
pub fn backfill_targets(
    source: &SourceConfig,
    mode: BackfillMode,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<Vec<ListingTarget>> {
    match mode {
        BackfillMode::Sitemap => match source.listing {
            ListingKind::Sitemap | ListingKind::Rss => Ok(scheduled_targets(source)),
            ListingKind::Pagination => Err(RegTruthError::config(format!(
                "source '{}' publishes no sitemap or feed",
                source.id
            ))),
        },
        BackfillMode::Pagination => {
            let template = match (&source.pagination_template, source.listing) {
                (Some(t), _) => t.clone(),
                (None, ListingKind::Pagination) => source.listing_url.clone(),
                (None, _) => {
                    return Err(RegTruthError::config(format!(
                        "source '{}' has no pagination_template",
                        source.id
                    )));
                }
            };
            Ok(vec![ListingTarget::Page {
                template,
                page: 1,
                max_pages: source.max_pages.max(1),
            }])
        }
        BackfillMode::Archive => {
            let template = source.archive_template.as_ref().ok_or_else(|| {
                RegTruthError::config(format!("source '{}' has no archive_template", source.id))
            })?;
            let last = date_to.unwrap_or(today).year();
            let first = date_from.map_or(last, |d| d.year());
            Ok((first..=last)
                .rev()
                .map(|year| ListingTarget::Page {
                    template: template.replace("{year}", &year.to_string()),
                    page: 1,
                    max_pages: source.max_pages.max(1),
                })
                .collect())
        }
    }
}

/// Result of reading one listing document.
#[derive(Debug, Default)]
pub struct ListingPage {
    pub entries: Vec<ListingEntry>,
    pub follow: Vec<ListingTarget>,
}

/// Reads listing documents through the polite fetcher, sleeping `delay`
/// between consecutive reads.
pub struct ListingWalker<'a> {
    fetcher: &'a Fetcher,
    delay: Duration,
    reads: usize,
}

impl<'a> ListingWalker<'a> {
    pub fn new(fetcher: &'a Fetcher, delay: Duration) -> Self {
        Self {
            fetcher,
            delay,
            reads: 0,
        }
    }

    /// Listing documents read so far.
    pub fn reads(&self) -> usize {
        self.reads
    }

    pub async fn read(
        &mut self,
        target: &ListingTarget,
        link_pattern: Option<&Regex>,
    ) -> Result<ListingPage> {
        if self.reads > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reads += 1;

        let url = target.url();
        debug!(%url, "reading listing");
        let body = self.fetcher.fetch_text(&url).await?;

        match target {
            ListingTarget::Sitemap { depth, .. } => match parse_sitemap(&body)? {
                Sitemap::Index(children) => {
                    let follow = if *depth < MAX_SITEMAP_DEPTH {
                        children
                            .into_iter()
                            .map(|url| ListingTarget::Sitemap {
                                url,
                                depth: depth + 1,
                            })
                            .collect()
                    } else {
                        debug!(%url, "sitemap index nested too deep, not following");
                        Vec::new()
                    };
                    Ok(ListingPage {
                        entries: Vec::new(),
                        follow,
                    })
                }
                Sitemap::UrlSet(entries) => Ok(ListingPage {
                    entries,
                    follow: Vec::new(),
                }),
            },
            ListingTarget::Feed { .. } => Ok(ListingPage {
                entries: parse_feed(&body)?,
                follow: Vec::new(),
            }),
            ListingTarget::Page { .. } => {
                let base = Url::parse(&url)
                    .map_err(|e| RegTruthError::parse(format!("invalid listing URL {url}: {e}")))?;
                let entries = parse_html_links(&body, &base, link_pattern);
                // An empty page ends the pagination.
                let follow = if entries.is_empty() {
                    Vec::new()
                } else {
                    target.next_page().into_iter().collect()
                };
                Ok(ListingPage { entries, follow })
            }
        }
    }
}

/// Compile a source's document-link pattern.
pub fn link_pattern(source: &SourceConfig) -> Result<Option<Regex>> {
    source
        .link_pattern
        .as_deref()
        .map(|p| {
            Regex::new(p).map_err(|e| {
                RegTruthError::config(format!("source '{}': invalid link_pattern: {e}", source.id))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source, test_fetcher};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn archive_targets_cover_each_year() {
        let mut src = source("nn", ListingKind::Pagination, "https://gov.example/list");
        src.archive_template = Some("https://gov.example/arhiva/{year}?page={page}".into());
        let targets = backfill_targets(
            &src,
            BackfillMode::Archive,
            NaiveDate::from_ymd_opt(2022, 3, 1),
            NaiveDate::from_ymd_opt(2024, 1, 1),
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        )
        .unwrap();
        let urls: Vec<_> = targets.iter().map(|t| t.url()).collect();
        assert_eq!(
            urls,
            vec![
                "https://gov.example/arhiva/2024?page=1",
                "https://gov.example/arhiva/2023?page=1",
                "https://gov.example/arhiva/2022?page=1",
            ]
        );
    }

    #[test]
    fn mode_requires_matching_listing() {
        let src = source("nn", ListingKind::Pagination, "https://gov.example/list?page={page}");
        let today = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert!(backfill_targets(&src, BackfillMode::Sitemap, None, None, today).is_err());
        assert!(backfill_targets(&src, BackfillMode::Archive, None, None, today).is_err());
        let pages = backfill_targets(&src, BackfillMode::Pagination, None, None, today).unwrap();
        assert_eq!(pages[0].url(), "https://gov.example/list?page=1");
    }

    #[tokio::test]
    async fn walks_sitemap_index_into_children() {
        let server = MockServer::start().await;
        let index = format!(
            "<sitemapindex><sitemap><loc>{0}/a.xml</loc></sitemap><sitemap><loc>{0}/b.xml</loc></sitemap></sitemapindex>",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index))
            .mount(&server)
            .await;
        Mock::given(path("/a.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<urlset><url><loc>https://gov.example/1</loc></url></urlset>",
            ))
            .mount(&server)
            .await;

        let fetcher = test_fetcher();
        let mut walker = ListingWalker::new(&fetcher, Duration::ZERO);
        let root = ListingTarget::Sitemap {
            url: format!("{}/sitemap.xml", server.uri()),
            depth: 0,
        };
        let page = walker.read(&root, None).await.unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.follow.len(), 2);
        assert_eq!(page.follow[0].crawl_depth(), 1);

        let child = walker.read(&page.follow[0], None).await.unwrap();
        assert_eq!(child.entries.len(), 1);
        assert!(walker.read(&page.follow[1], None).await.is_err());
        assert_eq!(walker.reads(), 3);
    }

    #[tokio::test]
    async fn pagination_stops_on_empty_page() {
        let server = MockServer::start().await;
        Mock::given(path("/list"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<a href="/doc/1">1</a>"#),
            )
            .mount(&server)
            .await;
        Mock::given(path("/list"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>nothing</p>"))
            .mount(&server)
            .await;

        let fetcher = test_fetcher();
        let mut walker = ListingWalker::new(&fetcher, Duration::ZERO);
        let first = ListingTarget::Page {
            template: format!("{}/list?page={{page}}", server.uri()),
            page: 1,
            max_pages: 10,
        };
        let page = walker.read(&first, None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.follow.len(), 1);

        let second = walker.read(&page.follow[0], None).await.unwrap();
        assert!(second.entries.is_empty());
        assert!(second.follow.is_empty());
    }
}
