//! Forward-only scheduled discovery.
//!
//! Each source is re-read when its tier cadence has elapsed since the last
//! pass. Paginated listings are newest-first, so the walk stops at the first
//! page that contributes nothing new.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regtruth_crawler::Fetcher;
use regtruth_shared::{AppConfig, Result, SourceConfig};
use regtruth_storage::Storage;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::listing::{ListingWalker, link_pattern, scheduled_targets};
use crate::surface::{DiscoveryQueue, RegisterOutcome};

/// Outcome of one scheduled pass over one source.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourcePass {
    pub source_id: String,
    /// `false` when the cadence had not elapsed and the source was not read.
    pub ran: bool,
    pub discovered: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub struct ScheduledDiscovery<'a> {
    storage: &'a Storage,
    fetcher: &'a Fetcher,
    config: &'a AppConfig,
}

impl<'a> ScheduledDiscovery<'a> {
    pub fn new(storage: &'a Storage, fetcher: &'a Fetcher, config: &'a AppConfig) -> Self {
        Self {
            storage,
            fetcher,
            config,
        }
    }

    /// Read every due source. `force` ignores the cadence.
    pub async fn run(&self, now: DateTime<Utc>, force: bool) -> Result<Vec<SourcePass>> {
        let mut passes = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            if !force && !self.is_due(source, now).await? {
                passes.push(SourcePass {
                    source_id: source.id.clone(),
                    ..SourcePass::default()
                });
                continue;
            }
            passes.push(self.run_source(source, now).await?);
        }
        Ok(passes)
    }

    async fn is_due(&self, source: &SourceConfig, now: DateTime<Utc>) -> Result<bool> {
        Ok(match self.storage.last_scheduled_at(&source.id).await? {
            Some(last) => last + source.tier.cadence() <= now,
            None => true,
        })
    }

    #[instrument(skip_all, fields(source = %source.id))]
    pub async fn run_source(&self, source: &SourceConfig, now: DateTime<Utc>) -> Result<SourcePass> {
        let mut pass = SourcePass {
            source_id: source.id.clone(),
            ran: true,
            ..SourcePass::default()
        };

        let pattern = match link_pattern(source) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "skipping source");
                pass.errors.push(e.to_string());
                return Ok(pass);
            }
        };

        let queue = DiscoveryQueue::scheduled(self.storage, self.config);
        let delay = Duration::from_millis(self.config.rate_limits.min_delay_ms);
        let mut walker = ListingWalker::new(self.fetcher, delay);
        let mut pending: VecDeque<_> = scheduled_targets(source).into();
        let mut listing_ok = false;

        while let Some(target) = pending.pop_front() {
            let page = match walker.read(&target, pattern.as_ref()).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(url = %target.url(), error = %e, "listing read failed");
                    pass.errors.push(format!("{}: {e}", target.url()));
                    continue;
                }
            };
            listing_ok = true;

            let mut queued_here = 0;
            for entry in &page.entries {
                pass.discovered += 1;
                match queue.register(source, entry, target.crawl_depth()).await {
                    Ok(RegisterOutcome::Queued { .. }) => {
                        pass.queued += 1;
                        queued_here += 1;
                    }
                    Ok(RegisterOutcome::Skipped) => pass.skipped += 1,
                    Err(e) => pass.errors.push(format!("{}: {e}", entry.url)),
                }
            }

            let stop_paging = target.is_page() && queued_here == 0;
            pending.extend(
                page.follow
                    .into_iter()
                    .filter(|next| !(stop_paging && next.is_page())),
            );
        }

        // A source whose listing could not be read at all stays due.
        if listing_ok {
            self.storage
                .record_scheduled_pass(&source.id, now, pass.discovered)
                .await?;
        }

        info!(
            discovered = pass.discovered,
            queued = pass.queued,
            skipped = pass.skipped,
            errors = pass.errors.len(),
            "scheduled pass finished"
        );
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source, test_fetcher, test_storage};
    use regtruth_shared::{ItemStatus, ListingKind, PriorityTier};
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_with(sources: Vec<SourceConfig>) -> AppConfig {
        let mut config = AppConfig::default();
        config.rate_limits.min_delay_ms = 0;
        config.rate_limits.max_delay_ms = 0;
        config.sources = sources;
        config
    }

    #[tokio::test]
    async fn respects_cadence_unless_forced() {
        let server = MockServer::start().await;
        Mock::given(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<rss><channel><item><link>https://gov.example/n/1</link></item>\
                 <item><link>https://gov.example/n/2</link></item></channel></rss>",
            ))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let mut src = source("fina", ListingKind::Rss, &format!("{}/feed", server.uri()));
        src.tier = PriorityTier::High;
        let config = config_with(vec![src]);
        let discovery = ScheduledDiscovery::new(&storage, &fetcher, &config);

        let now = Utc::now();
        let first = discovery.run(now, false).await.unwrap();
        assert!(first[0].ran);
        assert_eq!(first[0].queued, 2);

        let soon = discovery
            .run(now + chrono::Duration::hours(1), false)
            .await
            .unwrap();
        assert!(!soon[0].ran);

        let forced = discovery.run(now, true).await.unwrap();
        assert_eq!(forced[0].queued, 0);
        assert_eq!(forced[0].skipped, 2);

        let later = discovery
            .run(now + chrono::Duration::hours(7), false)
            .await
            .unwrap();
        assert!(later[0].ran);

        let counts = storage.count_items_by_status().await.unwrap();
        assert_eq!(counts, vec![(ItemStatus::Pending.as_str().to_string(), 2)]);
    }

    #[tokio::test]
    async fn pagination_stops_at_known_page() {
        let server = MockServer::start().await;
        Mock::given(path("/vijesti"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/vijesti/3">3</a><a href="/vijesti/2">2</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(path("/vijesti"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<a href="/vijesti/1">1</a>"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let src = source(
            "mfin",
            ListingKind::Pagination,
            &format!("{}/vijesti?page={{page}}", server.uri()),
        );
        let config = config_with(vec![src.clone()]);
        let discovery = ScheduledDiscovery::new(&storage, &fetcher, &config);

        let first = discovery.run_source(&src, Utc::now()).await.unwrap();
        assert_eq!(first.queued, 3);

        // Page 1 is fully known now, so page 2 is not read again.
        let second = discovery.run_source(&src, Utc::now()).await.unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn unreadable_listing_stays_due() {
        let server = MockServer::start().await;
        Mock::given(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let src = source(
            "dzs",
            ListingKind::Sitemap,
            &format!("{}/sitemap.xml", server.uri()),
        );
        let config = config_with(vec![src]);
        let discovery = ScheduledDiscovery::new(&storage, &fetcher, &config);

        let pass = &discovery.run(Utc::now(), false).await.unwrap()[0];
        assert_eq!(pass.errors.len(), 1);
        assert!(storage.last_scheduled_at("dzs").await.unwrap().is_none());
    }
}
