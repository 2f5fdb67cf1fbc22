//! Read-only health snapshot and the evidence staleness sweep.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regtruth_shared::{
    AppConfig, FreshnessRisk, QueueName, Result, StalenessStatus, canonicalize, job_id_for_canonical,
};
use regtruth_storage::{NewJob, QueueCount, Storage};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::stages::FetchJob;

/// Counts a dashboard reads, gathered in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub items: BTreeMap<String, i64>,
    pub evidence: BTreeMap<String, i64>,
    pub claims: i64,
    pub rules: BTreeMap<String, i64>,
    pub conflicts: BTreeMap<String, i64>,
    pub queues: Vec<QueueCount>,
    pub dead_letters: usize,
    pub rejections: usize,
    pub recent_backfills: Vec<BackfillSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub id: String,
    pub status: String,
    pub mode: String,
    pub dry_run: bool,
    pub discovered: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: usize,
    pub created_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub async fn collect(storage: &Storage) -> Result<Self> {
        let recent_backfills = storage
            .list_backfill_runs(5)
            .await?
            .into_iter()
            .map(|run| BackfillSummary {
                status: run.status.to_string(),
                mode: run.params.mode.to_string(),
                dry_run: run.params.dry_run,
                discovered: run.discovered_count,
                queued: run.queued_count,
                skipped: run.skipped_count,
                errors: run.error_count,
                created_at: run.created_at,
                id: run.id,
            })
            .collect();

        Ok(Self {
            generated_at: Utc::now(),
            items: storage.count_items_by_status().await?.into_iter().collect(),
            evidence: storage.count_evidence_by_staleness().await?.into_iter().collect(),
            claims: storage.count_claims().await?,
            rules: storage.count_rules_by_status().await?.into_iter().collect(),
            conflicts: storage.count_conflicts_by_status().await?.into_iter().collect(),
            queues: storage.queue_counts().await?,
            dead_letters: storage.list_dead_letters(None, 10_000).await?.len(),
            rejections: storage.list_rejections(10_000).await?.len(),
            recent_backfills,
        })
    }

    pub fn stale_evidence(&self) -> i64 {
        self.evidence
            .get(StalenessStatus::Stale.as_str())
            .copied()
            .unwrap_or(0)
    }
}

/// Outcome of one staleness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub marked_stale: usize,
    pub reverify_enqueued: usize,
}

fn max_age(config: &AppConfig, risk: FreshnessRisk) -> chrono::Duration {
    let days = match risk {
        FreshnessRisk::High => config.staleness.high_risk_days,
        FreshnessRisk::Medium => config.staleness.medium_risk_days,
        FreshnessRisk::Low => config.staleness.low_risk_days,
    };
    chrono::Duration::days(days.max(0))
}

/// Mark evidence older than its tier allows as STALE and enqueue a
/// re-verification fetch. One re-verify job per URL per day.
#[instrument(skip_all)]
pub async fn staleness_sweep(storage: &Storage, config: &AppConfig, now: DateTime<Utc>) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let fetch = config.queues.for_queue(QueueName::Fetch);

    for risk in [FreshnessRisk::High, FreshnessRisk::Medium, FreshnessRisk::Low] {
        let cutoff = now - max_age(config, risk);
        for candidate in storage.stale_candidates(risk.as_str(), cutoff).await? {
            storage
                .set_staleness(&candidate.evidence_id, StalenessStatus::Stale)
                .await?;
            report.marked_stale += 1;

            let canonical = canonicalize(&candidate.url)?;
            let id = format!(
                "{}@{}",
                job_id_for_canonical(&candidate.source_id, &canonical),
                now.format("%Y-%m-%d")
            );
            let payload = FetchJob {
                item_id: candidate.item_id.clone(),
                source_id: candidate.source_id.clone(),
                url: candidate.url.clone(),
                reverify: true,
            };
            let priority = config
                .source(&candidate.source_id)
                .map(|s| s.tier.queue_priority())
                .unwrap_or_default();
            let job = NewJob::new(
                QueueName::Fetch,
                id,
                serde_json::to_value(&payload)
                    .map_err(|e| regtruth_shared::RegTruthError::validation(e.to_string()))?,
            )
            .priority(priority)
            .max_attempts(fetch.attempts);
            if storage.enqueue(&job).await? {
                report.reverify_enqueued += 1;
            }
            debug!(url = %candidate.url, risk = %risk, last_verified = %candidate.last_verified_at, "evidence stale");
        }
    }

    if report.marked_stale > 0 {
        info!(marked = report.marked_stale, enqueued = report.reverify_enqueued, "staleness sweep");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{register, test_config, test_storage};
    use regtruth_shared::{ContentClass, ItemState};
    use regtruth_storage::NewEvidence;

    #[tokio::test]
    async fn old_evidence_is_flagged_and_reverified_once_a_day() {
        let storage = test_storage().await;
        let config = test_config();
        let payload = register(&storage, "https://gov.example/vijesti/1").await;

        let fetched_at = Utc::now() - chrono::Duration::days(30);
        let evidence = storage
            .upsert_evidence(&NewEvidence {
                source_id: payload.source_id.clone(),
                url: payload.url.clone(),
                content_hash: "h1".into(),
                raw_content: b"<p>x</p>".to_vec(),
                content_type: Some("text/html".into()),
                content_class: ContentClass::Html,
                fetched_at,
            })
            .await
            .unwrap();
        storage
            .set_item_state(
                &payload.item_id,
                &ItemState::Processed {
                    evidence_id: evidence.id.clone(),
                },
                Some("h1"),
                0,
            )
            .await
            .unwrap();

        let now = Utc::now();
        let report = staleness_sweep(&storage, &config, now).await.unwrap();
        assert_eq!(report, SweepReport { marked_stale: 1, reverify_enqueued: 1 });
        let stored = storage.get_evidence(&evidence.id).await.unwrap().unwrap();
        assert_eq!(stored.staleness, StalenessStatus::Stale);

        // Already STALE: not picked up again.
        let again = staleness_sweep(&storage, &config, now).await.unwrap();
        assert_eq!(again, SweepReport::default());

        let snapshot = HealthSnapshot::collect(&storage).await.unwrap();
        assert_eq!(snapshot.stale_evidence(), 1);
        let fetch = snapshot.queues.iter().find(|q| q.queue == "fetch").unwrap();
        assert_eq!(fetch.waiting, 2);
    }

    #[tokio::test]
    async fn fresh_evidence_is_left_alone() {
        let storage = test_storage().await;
        let payload = register(&storage, "https://gov.example/vijesti/2").await;
        let evidence = storage
            .upsert_evidence(&NewEvidence {
                source_id: payload.source_id.clone(),
                url: payload.url.clone(),
                content_hash: "h2".into(),
                raw_content: b"<p>y</p>".to_vec(),
                content_type: None,
                content_class: ContentClass::Html,
                fetched_at: Utc::now(),
            })
            .await
            .unwrap();
        storage
            .set_item_state(
                &payload.item_id,
                &ItemState::Fetched {
                    evidence_id: evidence.id,
                },
                None,
                0,
            )
            .await
            .unwrap();

        let report = staleness_sweep(&storage, &test_config(), Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
