//! Discovery producers for the regulatory-truth pipeline.
//!
//! Two producers feed one discovery surface:
//! - [`ScheduledDiscovery`] re-reads each source's listing on its tier cadence
//! - [`BackfillRunner`] walks historical listings on operator request
//!
//! Both register candidates through [`DiscoveryQueue`], which persists a
//! [`regtruth_shared::DiscoveredItem`] and enqueues a [`FetchJob`] under the
//! deterministic job ID of `(source, canonical url)`.

mod backfill;
mod listing;
mod parser;
mod scheduled;
mod surface;

pub use backfill::{BackfillReport, BackfillRunner};
pub use listing::{ListingPage, ListingTarget, ListingWalker, backfill_targets, scheduled_targets};
pub use parser::{ListingEntry, Sitemap, parse_feed, parse_html_links, parse_listing_date, parse_sitemap};
pub use scheduled::{ScheduledDiscovery, SourcePass};
pub use surface::{DiscoveryQueue, FetchJob, RegisterOutcome};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use regtruth_crawler::{DomainRateLimiter, Fetcher};
    use regtruth_shared::{
        AuthorityLevel, ChangeFrequency, FetchConfig, ListingKind, PriorityTier, RateLimitsConfig,
        SourceConfig,
    };
    use regtruth_storage::Storage;
    use uuid::Uuid;

    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("regtruth_discovery_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    /// Fetcher without politeness delays that may reach mock servers on localhost.
    pub(crate) fn test_fetcher() -> Fetcher {
        let limiter = Arc::new(DomainRateLimiter::new(RateLimitsConfig {
            min_delay_ms: 0,
            max_delay_ms: 0,
            max_concurrent: 4,
            domains: Vec::new(),
        }));
        Fetcher::new(&FetchConfig::default(), limiter)
            .expect("build fetcher")
            .allow_private_hosts()
    }

    pub(crate) fn source(id: &str, listing: ListingKind, listing_url: &str) -> SourceConfig {
        SourceConfig {
            id: id.into(),
            name: id.to_uppercase(),
            base_url: "https://gov.example".into(),
            listing,
            listing_url: listing_url.into(),
            pagination_template: matches!(listing, ListingKind::Pagination)
                .then(|| listing_url.to_string()),
            archive_template: None,
            link_pattern: None,
            max_pages: 50,
            tier: PriorityTier::Medium,
            authority: AuthorityLevel::SecondaryGuidance,
            change_frequency: ChangeFrequency::Weekly,
        }
    }
}
