//! Review: the auto-approval gate, plus the human override used by the CLI.

use std::sync::Arc;

use async_trait::async_trait;
use regtruth_shared::{QueueName, RegTruthError, ReviewConfig, Rule, RuleStatus};
use regtruth_storage::{Job, NewJob, Storage};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::RuleJob;
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode, enqueue_next};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Confident, grounded and uncontested.
    AutoApprove,
    /// Needs a human.
    Escalate,
    /// An open conflict references the rule; it stays DRAFT until arbitration.
    Blocked,
}

pub fn decide(rule: &Rule, has_open_conflict: bool, config: &ReviewConfig) -> ReviewDecision {
    if has_open_conflict {
        return ReviewDecision::Blocked;
    }
    let grounded = !rule.sources.is_empty() && rule.sources.len() >= config.min_sources;
    if grounded && rule.confidence > config.auto_approve_threshold {
        ReviewDecision::AutoApprove
    } else {
        ReviewDecision::Escalate
    }
}

pub struct ReviewStage {
    storage: Arc<Storage>,
}

impl ReviewStage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for ReviewStage {
    fn queue(&self) -> QueueName {
        QueueName::Review
    }

    #[instrument(skip_all, fields(rule_id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError> {
        let RuleJob { rule_id } = decode(job)?;
        tracing::Span::current().record("rule_id", rule_id.as_str());
        let Some(rule) = self.storage.get_rule(&rule_id).await? else {
            return Err(JobError::validation(format!("unknown rule {rule_id}"), job.payload.clone()));
        };
        if rule.status != RuleStatus::Draft {
            debug!(status = %rule.status, "rule already reviewed");
            return Ok(());
        }

        let conflicts = self.storage.open_conflicts_for_rule(&rule.id).await?;
        let decision = decide(&rule, !conflicts.is_empty(), &ctx.config.review);
        let actor = ctx.actor("review");
        match decision {
            ReviewDecision::Blocked => {
                let ids: Vec<&str> = conflicts.iter().map(|c| c.id.as_str()).collect();
                self.storage
                    .record_event("review", "rule", &rule.id, "blocked", Some(json!({ "conflicts": ids })))
                    .await?;
            }
            ReviewDecision::AutoApprove => {
                let reason = format!(
                    "confidence {:.2} > {:.2} with {} source(s)",
                    rule.confidence,
                    ctx.config.review.auto_approve_threshold,
                    rule.sources.len()
                );
                self.storage
                    .transition_rule(&rule.id, RuleStatus::Approved, &actor, Some(&reason))
                    .await?;
                enqueue_next(&self.storage, ctx, QueueName::Release, &rule.id, &RuleJob { rule_id: rule.id.clone() }, job.priority)
                    .await?;
            }
            ReviewDecision::Escalate => {
                let reason = format!(
                    "confidence {:.2} with {} source(s) needs a reviewer",
                    rule.confidence,
                    rule.sources.len()
                );
                self.storage
                    .transition_rule(&rule.id, RuleStatus::PendingReview, &actor, Some(&reason))
                    .await?;
                let ticket = json!({
                    "rule_id": rule.id,
                    "concept": rule.concept,
                    "value": rule.value,
                    "confidence": rule.confidence,
                    "sources": rule.sources,
                });
                let human = NewJob::new(QueueName::HumanReview, &rule.id, ticket)
                    .priority(job.priority)
                    .max_attempts(1);
                self.storage.enqueue(&human).await?;
            }
        }
        info!(concept = %rule.concept, ?decision, "rule reviewed");
        Ok(())
    }
}

/// Human disposition of a rule awaiting review.
///
/// Approval queues the rule for release; rejection is final.
pub async fn human_decision(
    storage: &Storage,
    ctx: &StageContext,
    rule_id: &str,
    approve: bool,
    reviewer: &str,
    note: Option<&str>,
) -> regtruth_shared::Result<RuleStatus> {
    let rule = storage
        .get_rule(rule_id)
        .await?
        .ok_or_else(|| RegTruthError::NotFound(format!("rule {rule_id}")))?;
    if approve && !storage.open_conflicts_for_rule(rule_id).await?.is_empty() {
        return Err(RegTruthError::validation(format!(
            "rule {rule_id} is part of an open conflict; arbitration decides it"
        )));
    }

    let to = if approve {
        RuleStatus::Approved
    } else {
        RuleStatus::Rejected
    };
    let actor = format!("human:{reviewer}");
    storage.transition_rule(&rule.id, to, &actor, note).await?;

    if storage.job_exists(QueueName::HumanReview, rule_id).await? {
        storage.complete_job(QueueName::HumanReview, rule_id).await?;
    }
    if approve {
        let payload = serde_json::to_value(RuleJob {
            rule_id: rule.id.clone(),
        })
        .map_err(|e| RegTruthError::validation(e.to_string()))?;
        let job = NewJob::new(QueueName::Release, &rule.id, payload)
            .max_attempts(ctx.config.queues.for_queue(QueueName::Release).attempts);
        storage.enqueue(&job).await?;
    }
    info!(rule_id, status = %to, reviewer, "human decision recorded");
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ctx, job, store_rule, test_storage};
    use regtruth_shared::AuthorityLevel;

    #[tokio::test]
    async fn confident_rule_is_approved_and_queued_for_release() {
        let storage = Arc::new(test_storage().await);
        let rule_id = store_rule(&storage, "vat-standard-rate", "25%", AuthorityLevel::PrimaryLegislation, 0.9).await;

        let stage = ReviewStage::new(storage.clone());
        let job = job(QueueName::Review, &rule_id, json!({ "rule_id": rule_id }));
        stage.handle(&ctx(), &job).await.unwrap();

        let rule = storage.get_rule(&rule_id).await.unwrap().unwrap();
        assert_eq!(rule.status, RuleStatus::Approved);
        assert!(storage.job_exists(QueueName::Release, &rule_id).await.unwrap());
    }

    #[tokio::test]
    async fn weak_rule_goes_to_a_human() {
        let storage = Arc::new(test_storage().await);
        let rule_id = store_rule(&storage, "vat-standard-rate", "25%", AuthorityLevel::SecondaryGuidance, 0.75).await;

        let stage = ReviewStage::new(storage.clone());
        let job = job(QueueName::Review, &rule_id, json!({ "rule_id": rule_id }));
        stage.handle(&ctx(), &job).await.unwrap();

        let rule = storage.get_rule(&rule_id).await.unwrap().unwrap();
        assert_eq!(rule.status, RuleStatus::PendingReview);
        assert!(storage.job_exists(QueueName::HumanReview, &rule_id).await.unwrap());
        assert!(!storage.job_exists(QueueName::Release, &rule_id).await.unwrap());

        // Reviewing again is a no-op.
        stage.handle(&ctx(), &job).await.unwrap();

        let status = human_decision(&storage, &ctx(), &rule_id, true, "ana", Some("checked NN 73/2013"))
            .await
            .unwrap();
        assert_eq!(status, RuleStatus::Approved);
        assert!(storage.job_exists(QueueName::Release, &rule_id).await.unwrap());
        let history = storage.rule_transitions(&rule_id).await.unwrap();
        assert_eq!(history.last().unwrap().2, "human:ana");
    }

    #[test]
    fn decision_table() {
        let config = ReviewConfig {
            auto_approve_threshold: 0.85,
            min_sources: 2,
        };
        let mut rule = crate::test_support::rule("r1", "25%", AuthorityLevel::PrimaryLegislation, 0.95);
        assert_eq!(decide(&rule, true, &config), ReviewDecision::Blocked);
        assert_eq!(decide(&rule, false, &config), ReviewDecision::Escalate);

        rule.sources.push(rule.sources[0].clone());
        assert_eq!(decide(&rule, false, &config), ReviewDecision::AutoApprove);

        rule.confidence = 0.85;
        assert_eq!(decide(&rule, false, &config), ReviewDecision::Escalate);

        rule.sources.clear();
        rule.confidence = 0.99;
        assert_eq!(decide(&rule, false, &config), ReviewDecision::Escalate);
    }
}
