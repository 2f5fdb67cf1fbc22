//! The shared discovery surface.
//!
//! Scheduled and backfill discovery both register candidates through
//! [`DiscoveryQueue`]; the method tag is the only difference. Uniqueness of
//! `(source, canonical url)` on the item table plus the deterministic fetch
//! job ID make registration idempotent across producers and runs.

use chrono::Utc;
use regtruth_shared::{
    AppConfig, ChangeFrequency, DiscoveredItem, DiscoveryMethod, ItemState, QueueName, Result,
    SourceConfig, canonicalize, job_id_for_canonical,
};
use regtruth_storage::{NewJob, Storage};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::parser::ListingEntry;

/// Payload of a `fetch` queue job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchJob {
    pub item_id: String,
    pub source_id: String,
    pub url: String,
    /// Staleness re-verification of an already processed item.
    #[serde(default)]
    pub reverify: bool,
}

/// What happened to one candidate URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New item persisted and its fetch job enqueued.
    Queued { item_id: String },
    /// Already on the surface for this source.
    Skipped,
}

/// Registration handle for one producer.
pub struct DiscoveryQueue<'a> {
    storage: &'a Storage,
    config: &'a AppConfig,
    method: DiscoveryMethod,
    backfill_run_id: Option<String>,
}

impl<'a> DiscoveryQueue<'a> {
    pub fn scheduled(storage: &'a Storage, config: &'a AppConfig) -> Self {
        Self {
            storage,
            config,
            method: DiscoveryMethod::Scheduled,
            backfill_run_id: None,
        }
    }

    pub fn backfill(storage: &'a Storage, config: &'a AppConfig, run_id: &str) -> Self {
        Self {
            storage,
            config,
            method: DiscoveryMethod::Backfill,
            backfill_run_id: Some(run_id.to_string()),
        }
    }

    /// Whether `url` is already known for `source`, without writing anything.
    pub async fn is_known(&self, source: &SourceConfig, url: &str) -> Result<bool> {
        let canonical = canonicalize(url)?;
        self.storage.item_exists(&source.id, &canonical).await
    }

    /// Persist a candidate unless it is already known, and enqueue its fetch.
    pub async fn register(
        &self,
        source: &SourceConfig,
        entry: &ListingEntry,
        crawl_depth: u32,
    ) -> Result<RegisterOutcome> {
        let canonical = canonicalize(&entry.url)?;
        if self.storage.item_exists(&source.id, &canonical).await? {
            return Ok(RegisterOutcome::Skipped);
        }

        let change_frequency = match entry.change_frequency {
            ChangeFrequency::Unknown => source.change_frequency,
            known => known,
        };
        let now = Utc::now();
        let item = DiscoveredItem {
            id: Uuid::now_v7().to_string(),
            source_id: source.id.clone(),
            url: entry.url.clone(),
            canonical_url: canonical.clone(),
            state: ItemState::Pending,
            method: self.method,
            content_hash: None,
            evidence_id: None,
            retry_count: 0,
            crawl_depth,
            change_frequency,
            freshness_risk: change_frequency.freshness_risk(),
            backfill_run_id: self.backfill_run_id.clone(),
            discovered_at: now,
            updated_at: now,
        };

        // A concurrent producer may have inserted it since the check above.
        if !self.storage.insert_item_if_absent(&item).await? {
            return Ok(RegisterOutcome::Skipped);
        }

        let payload = FetchJob {
            item_id: item.id.clone(),
            source_id: source.id.clone(),
            url: item.url.clone(),
            reverify: false,
        };
        let job = NewJob::new(
            QueueName::Fetch,
            job_id_for_canonical(&source.id, &canonical),
            serde_json::to_value(&payload)
                .map_err(|e| regtruth_shared::RegTruthError::validation(e.to_string()))?,
        )
        .priority(source.tier.queue_priority())
        .max_attempts(self.config.queues.for_queue(QueueName::Fetch).attempts);

        if !self.storage.enqueue(&job).await? {
            debug!(job_id = %job.id, "fetch job already present");
        }
        Ok(RegisterOutcome::Queued { item_id: item.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source, test_storage};
    use regtruth_shared::{ListingKind, job_id};

    #[tokio::test]
    async fn register_is_idempotent_across_producers() {
        let storage = test_storage().await;
        let config = AppConfig::default();
        let src = source("porezna", ListingKind::Sitemap, "https://gov.example/sitemap.xml");

        let scheduled = DiscoveryQueue::scheduled(&storage, &config);
        let entry = ListingEntry {
            url: "https://gov.example/vijesti/1?utm_source=rss".into(),
            published: None,
            change_frequency: ChangeFrequency::Daily,
        };
        let first = scheduled.register(&src, &entry, 0).await.unwrap();
        let RegisterOutcome::Queued { item_id } = first else {
            panic!("expected queued");
        };

        let backfill = DiscoveryQueue::backfill(&storage, &config, "run-1");
        let again = ListingEntry {
            url: "https://GOV.example/vijesti/1/".into(),
            ..entry.clone()
        };
        assert_eq!(
            backfill.register(&src, &again, 0).await.unwrap(),
            RegisterOutcome::Skipped
        );

        let item = storage.get_item(&item_id).await.unwrap().unwrap();
        assert_eq!(item.method, DiscoveryMethod::Scheduled);
        assert_eq!(item.change_frequency, ChangeFrequency::Daily);
        assert!(item.backfill_run_id.is_none());

        let id = job_id("porezna", &entry.url).unwrap();
        let job = storage.get_job(QueueName::Fetch, &id).await.unwrap().unwrap();
        let payload: FetchJob = serde_json::from_value(job.payload).unwrap();
        assert_eq!(payload.item_id, item_id);
        assert!(!payload.reverify);
        assert_eq!(job.priority, src.tier.queue_priority());
    }

    #[tokio::test]
    async fn unknown_change_frequency_falls_back_to_source() {
        let storage = test_storage().await;
        let config = AppConfig::default();
        let mut src = source("hzzo", ListingKind::Rss, "https://gov.example/rss");
        src.change_frequency = ChangeFrequency::Yearly;

        let queue = DiscoveryQueue::backfill(&storage, &config, "run-2");
        let entry = ListingEntry {
            url: "https://gov.example/pravilnik".into(),
            published: None,
            change_frequency: ChangeFrequency::Unknown,
        };
        let RegisterOutcome::Queued { item_id } = queue.register(&src, &entry, 1).await.unwrap()
        else {
            panic!("expected queued");
        };
        let item = storage.get_item(&item_id).await.unwrap().unwrap();
        assert_eq!(item.change_frequency, ChangeFrequency::Yearly);
        assert_eq!(item.crawl_depth, 1);
        assert_eq!(item.backfill_run_id.as_deref(), Some("run-2"));
        assert!(queue.is_known(&src, "https://gov.example/pravilnik/").await.unwrap());
    }
}
