//! Arbitration: pick one winner per open conflict.
//!
//! [`arbitrate`] depends only on the rule snapshots and the configured
//! criteria, so the same conflict always yields the same verdict. Input
//! order does not matter; the lowest rule id wins a full tie.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use regtruth_shared::{ArbitrationConfig, QueueName, ResolutionAudit, RuleSnapshot, TieBreak};
use regtruth_storage::{Job, ResolutionWrite, Storage};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{ConflictJob, RuleJob};
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode, enqueue_next};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub winner: String,
    pub losers: Vec<String>,
    /// First criterion separating the winner from the runner-up; `None`
    /// when only the rule-id fallback did.
    pub deciding_criterion: Option<TieBreak>,
}

/// How `a` compares to `b` on one criterion; `Greater` means `a` is preferred.
fn compare_on(criterion: TieBreak, a: &RuleSnapshot, b: &RuleSnapshot, epsilon: f64) -> Ordering {
    match criterion {
        TieBreak::Authority => a.authority.rank().cmp(&b.authority.rank()),
        TieBreak::Confidence => {
            if (a.confidence - b.confidence).abs() <= epsilon {
                Ordering::Equal
            } else {
                a.confidence.total_cmp(&b.confidence)
            }
        }
        TieBreak::Recency => a
            .effective_from
            .cmp(&b.effective_from)
            .then_with(|| a.created_at.cmp(&b.created_at)),
    }
}

/// The first criterion on which `a` and `b` differ, and who it favours.
fn separate(a: &RuleSnapshot, b: &RuleSnapshot, config: &ArbitrationConfig) -> Option<(TieBreak, Ordering)> {
    config.criteria.iter().find_map(|&criterion| {
        match compare_on(criterion, a, b, config.confidence_epsilon) {
            Ordering::Equal => None,
            ord => Some((criterion, ord)),
        }
    })
}

fn beats(a: &RuleSnapshot, b: &RuleSnapshot, config: &ArbitrationConfig) -> bool {
    match separate(a, b, config) {
        Some((_, ord)) => ord == Ordering::Greater,
        None => a.rule_id < b.rule_id,
    }
}

fn best<'a>(
    candidates: impl IntoIterator<Item = &'a RuleSnapshot>,
    config: &ArbitrationConfig,
) -> Option<&'a RuleSnapshot> {
    candidates.into_iter().fold(None, |best, next| match best {
        Some(current) if !beats(next, current, config) => Some(current),
        _ => Some(next),
    })
}

/// Choose among live candidates. `None` when there are none.
pub fn arbitrate(candidates: &[RuleSnapshot], config: &ArbitrationConfig) -> Option<Verdict> {
    let mut ordered: Vec<&RuleSnapshot> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

    let winner = best(ordered.iter().copied(), config)?;
    let rest: Vec<&RuleSnapshot> = ordered
        .iter()
        .copied()
        .filter(|s| s.rule_id != winner.rule_id)
        .collect();
    let deciding_criterion = best(rest.iter().copied(), config)
        .and_then(|runner_up| separate(winner, runner_up, config))
        .map(|(criterion, _)| criterion);

    Some(Verdict {
        winner: winner.rule_id.clone(),
        losers: rest.iter().map(|s| s.rule_id.clone()).collect(),
        deciding_criterion,
    })
}

pub struct ArbitrateStage {
    storage: Arc<Storage>,
}

impl ArbitrateStage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for ArbitrateStage {
    fn queue(&self) -> QueueName {
        QueueName::Arbitrate
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError> {
        let ConflictJob { conflict_id } = decode(job)?;
        let Some(conflict) = self.storage.get_conflict(&conflict_id).await? else {
            return Err(JobError::validation(
                format!("unknown conflict {conflict_id}"),
                job.payload.clone(),
            ));
        };
        if conflict.resolution.is_some() {
            debug!(%conflict_id, "conflict already resolved");
            return Ok(());
        }

        let mut inputs = Vec::with_capacity(conflict.rule_ids.len());
        for rule_id in &conflict.rule_ids {
            match self.storage.get_rule(rule_id).await? {
                Some(rule) => inputs.push(rule.snapshot()),
                None => return Err(JobError::Permanent(format!("conflict {conflict_id} names missing rule {rule_id}"))),
            }
        }
        let live: Vec<RuleSnapshot> = inputs.iter().filter(|s| s.status.is_live()).cloned().collect();
        let config = &ctx.config.arbitration;
        let Some(verdict) = arbitrate(&live, config) else {
            return Err(JobError::Permanent(format!("conflict {conflict_id} has no live rules")));
        };

        let losers = conflict
            .rule_ids
            .iter()
            .filter(|id| **id != verdict.winner)
            .cloned()
            .collect();
        let write = ResolutionWrite {
            conflict_id: conflict_id.clone(),
            audit: ResolutionAudit {
                winner: verdict.winner.clone(),
                losers,
                deciding_criterion: verdict.deciding_criterion,
                criteria: config.criteria.clone(),
                inputs,
                decided_by: ctx.actor("arbitrate"),
                resolved_at: ctx.now,
            },
            approve_winner: true,
        };
        if !self.storage.apply_resolution(&write).await? {
            debug!(%conflict_id, "resolved concurrently");
            return Ok(());
        }

        self.storage
            .record_event(
                "arbitrate",
                "conflict",
                &conflict_id,
                "resolved",
                Some(json!({ "winner": verdict.winner, "criterion": verdict.deciding_criterion })),
            )
            .await?;
        let release = RuleJob {
            rule_id: verdict.winner.clone(),
        };
        enqueue_next(
            &self.storage,
            ctx,
            QueueName::Release,
            format!("{}@{conflict_id}", verdict.winner),
            &release,
            job.priority,
        )
        .await?;
        info!(%conflict_id, winner = %verdict.winner, criterion = ?verdict.deciding_criterion, "conflict resolved");
        Ok(())
    }
}
