//! Release: APPROVED rules become PUBLISHED, with graph edges and an
//! outbox row for downstream sync.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use regtruth_shared::{ConflictStatus, EdgeKind, GraphEdge, QueueName, Rule, RuleStatus};
use regtruth_storage::{Job, PublicationWrite, Storage};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::RuleJob;
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode};

pub struct ReleaseStage {
    storage: Arc<Storage>,
}

impl ReleaseStage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Every pointer must resolve to a stored claim quoting stored evidence.
    async fn grounding_problem(&self, rule: &Rule) -> Result<Option<String>, JobError> {
        if rule.sources.is_empty() {
            return Ok(Some("rule has no source pointers".into()));
        }
        for source in &rule.sources {
            let Some(grounded) = self.storage.get_claim(&source.claim_id).await? else {
                return Ok(Some(format!("claim {} is missing", source.claim_id)));
            };
            if grounded.claim.exact_quote != source.exact_quote {
                return Ok(Some(format!("quote of claim {} does not match", source.claim_id)));
            }
            if self.storage.get_evidence(&source.evidence_id).await?.is_none() {
                return Ok(Some(format!("evidence {} is missing", source.evidence_id)));
            }
        }
        Ok(None)
    }

    /// Published rules the new one replaces: published losers of conflicts it
    /// won, and published rules of the same concept with an earlier effective date.
    async fn superseded(&self, rule: &Rule) -> Result<BTreeSet<String>, JobError> {
        let mut replaced = BTreeSet::new();
        for conflict in self.storage.list_conflicts(ConflictStatus::Resolved).await? {
            let Some(audit) = conflict.resolution else {
                continue;
            };
            if audit.winner != rule.id {
                continue;
            }
            replaced.extend(
                audit
                    .inputs
                    .into_iter()
                    .filter(|s| s.rule_id != rule.id && s.status == RuleStatus::Published)
                    .map(|s| s.rule_id),
            );
        }

        if let Some(effective) = rule.effective_from {
            for other in self.storage.published_rules(Some(&rule.concept)).await? {
                let earlier = other.effective_from.is_some_and(|d| d < effective);
                if other.id != rule.id && earlier {
                    replaced.insert(other.id);
                }
            }
        }
        Ok(replaced)
    }
}

#[async_trait]
impl JobHandler for ReleaseStage {
    fn queue(&self) -> QueueName {
        QueueName::Release
    }

    #[instrument(skip_all, fields(rule_id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError> {
        let RuleJob { rule_id } = decode(job)?;
        tracing::Span::current().record("rule_id", rule_id.as_str());
        let Some(rule) = self.storage.get_rule(&rule_id).await? else {
            return Err(JobError::validation(format!("unknown rule {rule_id}"), job.payload.clone()));
        };
        match rule.status {
            RuleStatus::Published => {
                if self.storage.release_signalled(&rule.id).await? {
                    debug!("already published");
                    return Ok(());
                }
                warn!("published without a release signal, completing the release");
            }
            RuleStatus::Approved => {
                if !self.storage.open_conflicts_for_rule(&rule.id).await?.is_empty() {
                    debug!("open conflict, waiting for arbitration");
                    return Ok(());
                }
                if let Some(problem) = self.grounding_problem(&rule).await? {
                    return Err(JobError::validation(
                        problem,
                        json!({ "rule_id": rule.id, "sources": rule.sources }),
                    ));
                }
            }
            other => {
                warn!(status = %other, "only approved rules are released");
                return Ok(());
            }
        }

        let replaced = self.superseded(&rule).await?;
        let edges = replaced
            .iter()
            .map(|old| GraphEdge {
                from_rule: rule.id.clone(),
                to_rule: old.clone(),
                kind: EdgeKind::Supersedes,
                created_at: ctx.now,
            })
            .collect();
        let signal = json!({
            "rule_id": rule.id,
            "concept": rule.concept,
            "value": rule.value,
            "value_type": rule.value_type,
            "authority": rule.authority,
            "confidence": rule.confidence,
            "effective_from": rule.effective_from,
            "sources": rule.sources,
            "supersedes": replaced,
        });
        let written = self
            .storage
            .publish_rule(&PublicationWrite {
                rule_id: rule.id.clone(),
                actor: ctx.actor("release"),
                edges,
                signal,
            })
            .await?;
        if !written {
            debug!("released concurrently");
            return Ok(());
        }
        info!(concept = %rule.concept, value = %rule.value, superseded = replaced.len(), "rule published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, job, store_rule, store_rule_on, test_storage};
    use chrono::NaiveDate;
    use regtruth_shared::AuthorityLevel;

    async fn approved(storage: &Storage, value: &str, year: i32) -> String {
        let id = store_rule_on(
            storage,
            "vat-standard-rate",
            value,
            AuthorityLevel::PrimaryLegislation,
            0.9,
            NaiveDate::from_ymd_opt(year, 1, 1),
        )
        .await;
        storage
            .transition_rule(&id, RuleStatus::Approved, "test", None)
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn publishes_and_signals() {
        let storage = Arc::new(test_storage().await);
        let rule_id = approved(&storage, "25%", 2013).await;

        let stage = ReleaseStage::new(storage.clone());
        let job = job(QueueName::Release, &rule_id, json!({ "rule_id": rule_id }));
        stage.handle(&ctx(), &job).await.unwrap();

        let rule = storage.get_rule(&rule_id).await.unwrap().unwrap();
        assert_eq!(rule.status, RuleStatus::Published);
        let events = storage.release_events_since(0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["value"], "25%");

        // Releasing again neither republishes nor signals twice.
        stage.handle(&ctx(), &job).await.unwrap();
        assert_eq!(storage.release_events_since(0, 10).await.unwrap().len(), 1);

        let published = storage.published_rules(Some("vat-standard-rate")).await.unwrap();
        assert_eq!(published.len(), 1);
        assert!(!published[0].sources.is_empty());
    }

    #[tokio::test]
    async fn drafts_are_not_released() {
        let storage = Arc::new(test_storage().await);
        let rule_id = store_rule(&storage, "vat-standard-rate", "25%", AuthorityLevel::PrimaryLegislation, 0.9).await;

        let stage = ReleaseStage::new(storage.clone());
        let job = job(QueueName::Release, &rule_id, json!({ "rule_id": rule_id }));
        stage.handle(&ctx(), &job).await.unwrap();

        let rule = storage.get_rule(&rule_id).await.unwrap().unwrap();
        assert_eq!(rule.status, RuleStatus::Draft);
        assert!(storage.release_events_since(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn later_effective_rule_supersedes_the_earlier_one() {
        let storage = Arc::new(test_storage().await);
        let old = approved(&storage, "23%", 2012).await;
        let stage = ReleaseStage::new(storage.clone());
        stage
            .handle(&ctx(), &job(QueueName::Release, &old, json!({ "rule_id": old })))
            .await
            .unwrap();

        let new = approved(&storage, "25%", 2013).await;
        stage
            .handle(&ctx(), &job(QueueName::Release, &new, json!({ "rule_id": new })))
            .await
            .unwrap();

        let edges = storage.edges_for_rule(&new).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to_rule, old);
        assert_eq!(edges[0].kind, EdgeKind::Supersedes);
        assert_eq!(storage.get_rule(&old).await.unwrap().unwrap().status, RuleStatus::Published);
    }

    #[tokio::test]
    async fn published_rule_missing_its_signal_is_completed_on_retry() {
        let storage = Arc::new(test_storage().await);
        let old = approved(&storage, "23%", 2012).await;
        let stage = ReleaseStage::new(storage.clone());
        stage
            .handle(&ctx(), &job(QueueName::Release, &old, json!({ "rule_id": old })))
            .await
            .unwrap();

        // Status committed, but edges and outbox row never written.
        let new = approved(&storage, "25%", 2013).await;
        storage
            .transition_rule(&new, RuleStatus::Published, "release", None)
            .await
            .unwrap();

        let job = job(QueueName::Release, &new, json!({ "rule_id": new }));
        stage.handle(&ctx(), &job).await.unwrap();
        stage.handle(&ctx(), &job).await.unwrap();

        let events = storage.release_events_since(0, 10).await.unwrap();
        let signals: Vec<_> = events.iter().filter(|e| e.rule_id == new).collect();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].payload["supersedes"], json!([old.clone()]));
        let edges = storage.edges_for_rule(&new).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to_rule, old);
    }
}
