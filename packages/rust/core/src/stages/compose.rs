//! Composition: claims about one concept -> draft rules and conflicts.
//!
//! [`compose`] is a pure planning step. Claims are grouped by effective
//! period and normalized value; a group matching an unpublished live rule
//! adds grounding to it, any other group becomes a new DRAFT rule. Two live
//! rules with different values for overlapping periods open one conflict.
//! An undated rule overlaps other undated rules and the latest dated period
//! of its concept, which is the one still open-ended.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regtruth_shared::{Conflict, ConflictStatus, QueueName, Rule, RuleStatus, SourcePointer};
use regtruth_storage::{CompositionWrite, GroundedClaim, Job, Storage};
use serde_json::json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{ComposeJob, ConflictJob, RuleJob};
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode, enqueue_next};

/// Redundant-claim preference: authority, then confidence, then the most
/// recent effective date, then the most recent capture.
fn prefer(a: &GroundedClaim, b: &GroundedClaim) -> Ordering {
    a.claim
        .authority
        .cmp(&b.claim.authority)
        .then_with(|| a.claim.confidence.total_cmp(&b.claim.confidence))
        .then_with(|| a.claim.effective_from.cmp(&b.claim.effective_from))
        .then_with(|| a.claim.created_at.cmp(&b.claim.created_at))
}

fn pointer(grounded: &GroundedClaim) -> SourcePointer {
    SourcePointer {
        claim_id: grounded.claim.id.clone(),
        evidence_id: grounded.claim.evidence_id.clone(),
        url: grounded.url.clone(),
        exact_quote: grounded.claim.exact_quote.clone(),
    }
}

/// Plan the writes for one concept. Running it again on its own output
/// plans nothing.
pub fn compose(
    concept: &str,
    claims: &[GroundedClaim],
    rules: &[Rule],
    open_conflicts: &[Conflict],
    now: DateTime<Utc>,
) -> CompositionWrite {
    let consumed: HashSet<&str> = rules
        .iter()
        .flat_map(|r| r.sources.iter().map(|s| s.claim_id.as_str()))
        .collect();

    let mut groups: BTreeMap<(Option<NaiveDate>, &str), Vec<&GroundedClaim>> = BTreeMap::new();
    for grounded in claims {
        let claim = &grounded.claim;
        if claim.concept != concept || consumed.contains(claim.id.as_str()) {
            continue;
        }
        groups
            .entry((claim.effective_from, claim.normalized_value.as_str()))
            .or_default()
            .push(grounded);
    }

    let mut write = CompositionWrite::default();
    for ((period, value), members) in groups {
        let existing = rules
            .iter()
            .find(|r| r.status.is_live() && r.effective_from == period && r.value == value);
        match existing {
            // Published grounding is immutable; the claims only corroborate.
            Some(rule) if rule.status == RuleStatus::Published => {}
            Some(rule) => {
                for grounded in members {
                    write.attach_sources.push((rule.id.clone(), pointer(grounded)));
                }
            }
            None => {
                let Some(best) = members.iter().copied().max_by(|a, b| prefer(a, b)) else {
                    continue;
                };
                let authority = members.iter().map(|m| m.claim.authority).max().unwrap_or(best.claim.authority);
                write.new_rules.push(Rule {
                    id: Uuid::now_v7().to_string(),
                    concept: concept.to_string(),
                    value: value.to_string(),
                    value_type: best.claim.value_type,
                    status: RuleStatus::Draft,
                    authority,
                    confidence: best.claim.confidence,
                    effective_from: period,
                    sources: members.iter().map(|m| pointer(m)).collect(),
                    created_at: now,
                    updated_at: now,
                });
            }
        }
    }

    let candidates = || {
        rules
            .iter()
            .filter(|r| r.status.is_live())
            .chain(write.new_rules.iter())
    };
    let latest = candidates().map(|r| r.effective_from).max().flatten();
    let mut touched = BTreeSet::new();
    for rule in &write.new_rules {
        touched.insert(rule.effective_from);
        if rule.effective_from.is_none() && latest.is_some() {
            touched.insert(latest);
        }
    }

    for period in touched {
        let live: Vec<(&str, &str)> = candidates()
            .filter(|r| overlaps(r.effective_from, period, latest))
            .map(|r| (r.id.as_str(), r.value.as_str()))
            .collect();
        let values: BTreeSet<&str> = live.iter().map(|(_, v)| *v).collect();
        if values.len() < 2 {
            continue;
        }

        let open = open_conflicts
            .iter()
            .find(|c| c.status == ConflictStatus::Open && c.effective_from == period);
        match open {
            Some(conflict) => {
                for (id, _) in &live {
                    if !conflict.rule_ids.iter().any(|r| r == id) {
                        write
                            .conflict_additions
                            .push((conflict.id.clone(), id.to_string()));
                    }
                }
            }
            None => {
                let mut rule_ids: Vec<String> = live.iter().map(|(id, _)| id.to_string()).collect();
                rule_ids.sort();
                write.new_conflicts.push(Conflict {
                    id: Uuid::now_v7().to_string(),
                    concept: concept.to_string(),
                    effective_from: period,
                    rule_ids,
                    status: ConflictStatus::Open,
                    resolution: None,
                    created_at: now,
                });
            }
        }
    }
    write
}

/// Whether a rule effective from `from` applies during `period`.
fn overlaps(from: Option<NaiveDate>, period: Option<NaiveDate>, latest: Option<NaiveDate>) -> bool {
    from == period || (from.is_none() && period == latest)
}

pub struct ComposeStage {
    storage: Arc<Storage>,
}

impl ComposeStage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for ComposeStage {
    fn queue(&self) -> QueueName {
        QueueName::Compose
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError> {
        let ComposeJob { concept } = decode(job)?;
        let claims = self.storage.claims_for_concept(&concept).await?;
        let rules = self.storage.rules_for_concept(&concept).await?;
        let open = self.storage.open_conflicts_for_concept(&concept).await?;

        let write = compose(&concept, &claims, &rules, &open, ctx.now);
        if write.is_empty() {
            debug!(%concept, "nothing to compose");
            return Ok(());
        }
        self.storage.apply_composition(&write).await?;

        for rule in &write.new_rules {
            let payload = RuleJob {
                rule_id: rule.id.clone(),
            };
            enqueue_next(&self.storage, ctx, QueueName::Review, &rule.id, &payload, job.priority).await?;
        }
        let conflict_ids: BTreeSet<&str> = write
            .new_conflicts
            .iter()
            .map(|c| c.id.as_str())
            .chain(write.conflict_additions.iter().map(|(c, _)| c.as_str()))
            .collect();
        for conflict_id in conflict_ids {
            let payload = ConflictJob {
                conflict_id: conflict_id.to_string(),
            };
            enqueue_next(&self.storage, ctx, QueueName::Arbitrate, conflict_id, &payload, job.priority)
                .await?;
        }

        self.storage
            .record_event(
                "compose",
                "concept",
                &concept,
                "composed",
                Some(json!({
                    "new_rules": write.new_rules.iter().map(|r| &r.id).collect::<Vec<_>>(),
                    "attached": write.attach_sources.len(),
                    "new_conflicts": write.new_conflicts.iter().map(|c| &c.id).collect::<Vec<_>>(),
                })),
            )
            .await?;
        info!(
            %concept,
            new_rules = write.new_rules.len(),
            attached = write.attach_sources.len(),
            conflicts = write.new_conflicts.len() + write.conflict_additions.len(),
            "composition applied"
        );
        Ok(())
    }
}
