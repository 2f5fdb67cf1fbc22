//! Rule, rule-source and conflict operations.
//!
//! Multi-row writes (composition output, conflict resolution, release) are
//! applied atomically through [`Storage::apply_composition`],
//! [`Storage::apply_resolution`] and [`Storage::publish_rule`].

use chrono::Utc;
use libsql::{Connection, params};
use regtruth_shared::{
    Conflict, ConflictStatus, GraphEdge, RegTruthError, ResolutionAudit, Result, Rule, RuleStatus,
    SourcePointer,
};

use crate::{Storage, date_str, get_json, get_opt_date, get_parsed, get_string, get_ts, to_json, ts};

const RULE_COLUMNS: &str = "id, concept, value, value_type, status, authority, confidence, \
     effective_from, created_at, updated_at";

/// Everything one composition pass decided, written in one transaction.
#[derive(Debug, Clone, Default)]
pub struct CompositionWrite {
    /// New DRAFT rules, with their initial grounding.
    pub new_rules: Vec<Rule>,
    /// Extra grounding for existing unpublished rules: `(rule_id, pointer)`.
    pub attach_sources: Vec<(String, SourcePointer)>,
    /// Newly detected conflicts.
    pub new_conflicts: Vec<Conflict>,
    /// Rules joining an already open conflict: `(conflict_id, rule_id)`.
    pub conflict_additions: Vec<(String, String)>,
}

impl CompositionWrite {
    pub fn is_empty(&self) -> bool {
        self.new_rules.is_empty()
            && self.attach_sources.is_empty()
            && self.new_conflicts.is_empty()
            && self.conflict_additions.is_empty()
    }
}

/// The outcome of arbitrating one conflict.
#[derive(Debug, Clone)]
pub struct ResolutionWrite {
    pub conflict_id: String,
    pub audit: ResolutionAudit,
    /// Whether to approve the winner (unless it is already published).
    pub approve_winner: bool,
}

/// Publication of one rule: status change, supersession edges, outbox row
/// and audit event.
#[derive(Debug, Clone)]
pub struct PublicationWrite {
    pub rule_id: String,
    pub actor: String,
    pub edges: Vec<GraphEdge>,
    /// Payload of the `published` outbox row.
    pub signal: serde_json::Value,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Rules
    // -----------------------------------------------------------------------

    pub async fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(RegTruthError::storage)?;

        let rule = match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => row_to_rule(&row)?,
            None => return Ok(None),
        };
        drop(rows);
        Ok(Some(self.with_sources(rule).await?))
    }

    /// All rules for a concept, any status, oldest first.
    pub async fn rules_for_concept(&self, concept: &str) -> Result<Vec<Rule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE concept = ?1 ORDER BY created_at, id"
        );
        self.query_rules(&sql, params![concept]).await
    }

    /// Rules filtered by status, newest first.
    pub async fn list_rules(&self, status: Option<RuleStatus>, limit: usize) -> Result<Vec<Rule>> {
        match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE status = ?1
                     ORDER BY updated_at DESC LIMIT ?2"
                );
                self.query_rules(&sql, params![status.as_str(), limit as i64])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {RULE_COLUMNS} FROM rules ORDER BY updated_at DESC LIMIT ?1"
                );
                self.query_rules(&sql, params![limit as i64]).await
            }
        }
    }

    /// Published rules in retrieval order: authority, then confidence, then
    /// the most recent effective date, then the most recent creation.
    pub async fn published_rules(&self, concept: Option<&str>) -> Result<Vec<Rule>> {
        const ORDER: &str =
            "ORDER BY authority_rank DESC, confidence DESC, effective_from DESC, created_at DESC";
        match concept {
            Some(concept) => {
                let sql = format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE status = 'PUBLISHED' AND concept = ?1 {ORDER}"
                );
                self.query_rules(&sql, params![concept]).await
            }
            None => {
                let sql =
                    format!("SELECT {RULE_COLUMNS} FROM rules WHERE status = 'PUBLISHED' {ORDER}");
                self.query_rules(&sql, params![]).await
            }
        }
    }

    /// Move a rule along its lifecycle, recording who moved it and why.
    ///
    /// Returns the previous status. Moving to the current status is a no-op.
    pub async fn transition_rule(
        &self,
        rule_id: &str,
        to: RuleStatus,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<RuleStatus> {
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(RegTruthError::storage)?;
        let from = transition_in(&tx, rule_id, to, actor, reason).await?;
        tx.commit().await.map_err(RegTruthError::storage)?;
        Ok(from)
    }

    /// `(from, to, actor, reason)` history of a rule, oldest first.
    pub async fn rule_transitions(
        &self,
        rule_id: &str,
    ) -> Result<Vec<(RuleStatus, RuleStatus, String, Option<String>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT from_status, to_status, actor, reason FROM rule_transitions
                 WHERE rule_id = ?1 ORDER BY id",
                params![rule_id],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push((
                get_parsed(&row, 0)?,
                get_parsed(&row, 1)?,
                get_string(&row, 2)?,
                row.get::<String>(3).ok(),
            ));
        }
        Ok(results)
    }

    pub async fn count_rules_by_status(&self) -> Result<Vec<(String, i64)>> {
        self.count_grouped("rules", "status").await
    }

    async fn query_rules(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Rule>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(RegTruthError::storage)?;

        let mut bare = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            bare.push(row_to_rule(&row)?);
        }
        drop(rows);

        let mut results = Vec::with_capacity(bare.len());
        for rule in bare {
            results.push(self.with_sources(rule).await?);
        }
        Ok(results)
    }

    async fn with_sources(&self, mut rule: Rule) -> Result<Rule> {
        let mut rows = self
            .conn
            .query(
                "SELECT claim_id, evidence_id, url, exact_quote FROM rule_sources
                 WHERE rule_id = ?1 ORDER BY rowid",
                params![rule.id.as_str()],
            )
            .await
            .map_err(RegTruthError::storage)?;

        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            rule.sources.push(SourcePointer {
                claim_id: get_string(&row, 0)?,
                evidence_id: get_string(&row, 1)?,
                url: get_string(&row, 2)?,
                exact_quote: get_string(&row, 3)?,
            });
        }
        Ok(rule)
    }

    // -----------------------------------------------------------------------
    // Conflicts
    // -----------------------------------------------------------------------

    pub async fn get_conflict(&self, id: &str) -> Result<Option<Conflict>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, concept, effective_from, status, resolution_json, created_at
                 FROM conflicts WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let conflict = match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => row_to_conflict(&row)?,
            None => return Ok(None),
        };
        drop(rows);
        Ok(Some(self.with_members(conflict).await?))
    }

    /// Open conflicts that reference `rule_id`.
    pub async fn open_conflicts_for_rule(&self, rule_id: &str) -> Result<Vec<Conflict>> {
        self.query_conflicts(
            "SELECT c.id, c.concept, c.effective_from, c.status, c.resolution_json, c.created_at
             FROM conflicts c JOIN conflict_rules cr ON cr.conflict_id = c.id
             WHERE cr.rule_id = ?1 AND c.status = 'OPEN' ORDER BY c.created_at",
            params![rule_id],
        )
        .await
    }

    /// Open conflicts for a concept, all periods.
    pub async fn open_conflicts_for_concept(&self, concept: &str) -> Result<Vec<Conflict>> {
        self.query_conflicts(
            "SELECT id, concept, effective_from, status, resolution_json, created_at
             FROM conflicts WHERE concept = ?1 AND status = 'OPEN' ORDER BY created_at",
            params![concept],
        )
        .await
    }

    pub async fn list_conflicts(&self, status: ConflictStatus) -> Result<Vec<Conflict>> {
        self.query_conflicts(
            "SELECT id, concept, effective_from, status, resolution_json, created_at
             FROM conflicts WHERE status = ?1 ORDER BY created_at",
            params![status.as_str()],
        )
        .await
    }

    pub async fn count_conflicts_by_status(&self) -> Result<Vec<(String, i64)>> {
        self.count_grouped("conflicts", "status").await
    }

    async fn query_conflicts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Conflict>> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(RegTruthError::storage)?;

        let mut bare = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            bare.push(row_to_conflict(&row)?);
        }
        drop(rows);

        let mut results = Vec::with_capacity(bare.len());
        for conflict in bare {
            results.push(self.with_members(conflict).await?);
        }
        Ok(results)
    }

    async fn with_members(&self, mut conflict: Conflict) -> Result<Conflict> {
        let mut rows = self
            .conn
            .query(
                "SELECT rule_id FROM conflict_rules WHERE conflict_id = ?1 ORDER BY rule_id",
                params![conflict.id.as_str()],
            )
            .await
            .map_err(RegTruthError::storage)?;
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            conflict.rule_ids.push(get_string(&row, 0)?);
        }
        Ok(conflict)
    }

    // -----------------------------------------------------------------------
    // Atomic writes
    // -----------------------------------------------------------------------

    /// Apply a composition plan atomically.
    pub async fn apply_composition(&self, write: &CompositionWrite) -> Result<()> {
        if write.is_empty() {
            return Ok(());
        }
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(RegTruthError::storage)?;

        for rule in &write.new_rules {
            tx.execute(
                "INSERT INTO rules (id, concept, value, value_type, status, authority, authority_rank,
                    confidence, effective_from, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    rule.id.as_str(),
                    rule.concept.as_str(),
                    rule.value.as_str(),
                    rule.value_type.as_str(),
                    rule.status.as_str(),
                    rule.authority.as_str(),
                    rule.authority.rank(),
                    rule.confidence,
                    date_str(rule.effective_from),
                    ts(&rule.created_at),
                    ts(&rule.updated_at),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;

            for source in &rule.sources {
                insert_source(&tx, &rule.id, source).await?;
            }
        }

        for (rule_id, source) in &write.attach_sources {
            insert_source(&tx, rule_id, source).await?;
            tx.execute(
                "UPDATE rules SET updated_at = ?1 WHERE id = ?2 AND status != 'PUBLISHED'",
                params![ts(&Utc::now()), rule_id.as_str()],
            )
            .await
            .map_err(RegTruthError::storage)?;
        }

        for conflict in &write.new_conflicts {
            tx.execute(
                "INSERT INTO conflicts (id, concept, effective_from, status, created_at)
                 VALUES (?1, ?2, ?3, 'OPEN', ?4)",
                params![
                    conflict.id.as_str(),
                    conflict.concept.as_str(),
                    date_str(conflict.effective_from),
                    ts(&conflict.created_at),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
            for rule_id in &conflict.rule_ids {
                add_member(&tx, &conflict.id, rule_id).await?;
            }
        }

        for (conflict_id, rule_id) in &write.conflict_additions {
            add_member(&tx, conflict_id, rule_id).await?;
        }

        tx.commit().await.map_err(RegTruthError::storage)?;
        tracing::debug!(
            new_rules = write.new_rules.len(),
            attached = write.attach_sources.len(),
            new_conflicts = write.new_conflicts.len(),
            "composition applied"
        );
        Ok(())
    }

    /// Close a conflict, deprecate the losers and optionally approve the winner.
    ///
    /// Returns `false` (and writes nothing) if the conflict was already resolved.
    pub async fn apply_resolution(&self, write: &ResolutionWrite) -> Result<bool> {
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(RegTruthError::storage)?;
        let actor = write.audit.decided_by.as_str();

        let closed = tx
            .execute(
                "UPDATE conflicts SET status = 'RESOLVED', resolution_json = ?1, resolved_at = ?2
                 WHERE id = ?3 AND status = 'OPEN'",
                params![
                    to_json(&write.audit)?,
                    ts(&write.audit.resolved_at),
                    write.conflict_id.as_str(),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        if closed == 0 {
            return Ok(false);
        }

        let reason = format!("lost arbitration of conflict {}", write.conflict_id);
        for loser in &write.audit.losers {
            let status = status_in(&tx, loser).await?;
            if status.is_live() {
                transition_in(&tx, loser, RuleStatus::Deprecated, actor, Some(&reason)).await?;
            }
        }

        if write.approve_winner {
            let winner = write.audit.winner.as_str();
            let status = status_in(&tx, winner).await?;
            if status.can_transition_to(RuleStatus::Approved) {
                let reason = format!("won arbitration of conflict {}", write.conflict_id);
                transition_in(&tx, winner, RuleStatus::Approved, actor, Some(&reason)).await?;
            }
        }

        tx.commit().await.map_err(RegTruthError::storage)?;
        Ok(true)
    }

    /// Publish an APPROVED rule in one transaction.
    ///
    /// A rule that is already PUBLISHED gets its missing edges and outbox row
    /// filled in. Returns `false` if the outbox row already existed, in which
    /// case nothing is written.
    pub async fn publish_rule(&self, write: &PublicationWrite) -> Result<bool> {
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(RegTruthError::storage)?;
        let rule_id = write.rule_id.as_str();

        if release_signalled_in(&tx, rule_id).await? {
            return Ok(false);
        }
        transition_in(&tx, rule_id, RuleStatus::Published, &write.actor, None).await?;

        for edge in &write.edges {
            tx.execute(
                "INSERT INTO graph_edges (from_rule, to_rule, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(from_rule, to_rule, kind) DO NOTHING",
                params![
                    edge.from_rule.as_str(),
                    edge.to_rule.as_str(),
                    edge.kind.as_str(),
                    ts(&edge.created_at),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        }

        let now = ts(&Utc::now());
        tx.execute(
            "INSERT INTO release_events (rule_id, kind, payload_json, created_at)
             VALUES (?1, 'published', ?2, ?3)",
            params![rule_id, write.signal.to_string(), now.as_str()],
        )
        .await
        .map_err(RegTruthError::storage)?;

        let superseded: Vec<&str> = write.edges.iter().map(|e| e.to_rule.as_str()).collect();
        let detail = serde_json::json!({ "supersedes": superseded }).to_string();
        tx.execute(
            "INSERT INTO audit_events (at, stage, entity_kind, entity_id, action, detail_json)
             VALUES (?1, 'release', 'rule', ?2, 'published', ?3)",
            params![now.as_str(), rule_id, detail],
        )
        .await
        .map_err(RegTruthError::storage)?;

        tx.commit().await.map_err(RegTruthError::storage)?;
        Ok(true)
    }

    /// Whether a `published` outbox row exists for the rule.
    pub async fn release_signalled(&self, rule_id: &str) -> Result<bool> {
        release_signalled_in(&self.conn, rule_id).await
    }
}

async fn release_signalled_in(conn: &Connection, rule_id: &str) -> Result<bool> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM release_events WHERE rule_id = ?1 AND kind = 'published' LIMIT 1",
            params![rule_id],
        )
        .await
        .map_err(RegTruthError::storage)?;
    Ok(rows.next().await.map_err(RegTruthError::storage)?.is_some())
}

async fn insert_source(conn: &Connection, rule_id: &str, source: &SourcePointer) -> Result<()> {
    conn.execute(
        "INSERT INTO rule_sources (rule_id, claim_id, evidence_id, url, exact_quote)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(rule_id, claim_id) DO NOTHING",
        params![
            rule_id,
            source.claim_id.as_str(),
            source.evidence_id.as_str(),
            source.url.as_str(),
            source.exact_quote.as_str(),
        ],
    )
    .await
    .map_err(RegTruthError::storage)?;
    Ok(())
}

async fn add_member(conn: &Connection, conflict_id: &str, rule_id: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO conflict_rules (conflict_id, rule_id) VALUES (?1, ?2)
         ON CONFLICT(conflict_id, rule_id) DO NOTHING",
        params![conflict_id, rule_id],
    )
    .await
    .map_err(RegTruthError::storage)?;
    Ok(())
}

async fn status_in(conn: &Connection, rule_id: &str) -> Result<RuleStatus> {
    let mut rows = conn
        .query("SELECT status FROM rules WHERE id = ?1", params![rule_id])
        .await
        .map_err(RegTruthError::storage)?;
    match rows.next().await.map_err(RegTruthError::storage)? {
        Some(row) => get_parsed(&row, 0),
        None => Err(RegTruthError::NotFound(format!("rule {rule_id}"))),
    }
}

/// Validated status change plus its history row, on the given connection.
async fn transition_in(
    conn: &Connection,
    rule_id: &str,
    to: RuleStatus,
    actor: &str,
    reason: Option<&str>,
) -> Result<RuleStatus> {
    let from = status_in(conn, rule_id).await?;
    if from == to {
        return Ok(from);
    }
    if !from.can_transition_to(to) {
        return Err(RegTruthError::InvalidTransition {
            entity: format!("rule {rule_id}"),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = ts(&Utc::now());
    let affected = conn
        .execute(
            "UPDATE rules SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now.as_str(), rule_id, from.as_str()],
        )
        .await
        .map_err(RegTruthError::storage)?;
    if affected == 0 {
        return Err(RegTruthError::Storage(format!(
            "rule {rule_id} changed status concurrently"
        )));
    }

    conn.execute(
        "INSERT INTO rule_transitions (rule_id, from_status, to_status, actor, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![rule_id, from.as_str(), to.as_str(), actor, reason, now.as_str()],
    )
    .await
    .map_err(RegTruthError::storage)?;

    tracing::info!(rule_id, from = %from, to = %to, actor, "rule transition");
    Ok(from)
}

fn row_to_rule(row: &libsql::Row) -> Result<Rule> {
    Ok(Rule {
        id: get_string(row, 0)?,
        concept: get_string(row, 1)?,
        value: get_string(row, 2)?,
        value_type: get_parsed(row, 3)?,
        status: get_parsed(row, 4)?,
        authority: get_parsed(row, 5)?,
        confidence: row.get::<f64>(6).map_err(RegTruthError::storage)?,
        effective_from: get_opt_date(row, 7)?,
        sources: Vec::new(),
        created_at: get_ts(row, 8)?,
        updated_at: get_ts(row, 9)?,
    })
}

fn row_to_conflict(row: &libsql::Row) -> Result<Conflict> {
    let resolution: Option<ResolutionAudit> = match row.get::<String>(4) {
        Ok(_) => Some(get_json(row, 4)?),
        Err(_) => None,
    };
    Ok(Conflict {
        id: get_string(row, 0)?,
        concept: get_string(row, 1)?,
        effective_from: get_opt_date(row, 2)?,
        rule_ids: Vec::new(),
        status: get_parsed(row, 3)?,
        resolution,
        created_at: get_ts(row, 5)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::claims::tests::claim;
    use crate::evidence::tests::new_evidence;
    use crate::test_support::test_storage;
    use chrono::NaiveDate;
    use regtruth_shared::{AuthorityLevel, EdgeKind, TieBreak, ValueType};
    use uuid::Uuid;

    pub(crate) fn draft_rule(concept: &str, value: &str, authority: AuthorityLevel) -> Rule {
        let now = Utc::now();
        Rule {
            id: Uuid::now_v7().to_string(),
            concept: concept.into(),
            value: value.into(),
            value_type: ValueType::NumericThreshold,
            status: RuleStatus::Draft,
            authority,
            confidence: 0.9,
            effective_from: NaiveDate::from_ymd_opt(2025, 1, 1),
            sources: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A draft rule grounded in a freshly stored claim.
    pub(crate) async fn grounded_rule(
        storage: &Storage,
        concept: &str,
        value: &str,
        authority: AuthorityLevel,
    ) -> Rule {
        let url = format!("https://example.com/{}", Uuid::now_v7());
        let ev = storage
            .upsert_evidence(&new_evidence(&url, value))
            .await
            .unwrap();
        let c = claim(&ev.id, concept, value);
        let claim_id = storage.insert_claim(&c).await.unwrap();
        let mut rule = draft_rule(concept, value, authority);
        rule.sources.push(SourcePointer {
            claim_id,
            evidence_id: ev.id,
            url,
            exact_quote: c.exact_quote,
        });
        rule
    }

    #[tokio::test]
    async fn composition_writes_rules_and_conflicts() {
        let storage = test_storage().await;
        let a = grounded_rule(&storage, "vat", "25%", AuthorityLevel::PrimaryLegislation).await;
        let b = grounded_rule(&storage, "vat", "13%", AuthorityLevel::SecondaryGuidance).await;
        let conflict = Conflict {
            id: Uuid::now_v7().to_string(),
            concept: "vat".into(),
            effective_from: a.effective_from,
            rule_ids: vec![a.id.clone(), b.id.clone()],
            status: ConflictStatus::Open,
            resolution: None,
            created_at: Utc::now(),
        };
        storage
            .apply_composition(&CompositionWrite {
                new_rules: vec![a.clone(), b.clone()],
                new_conflicts: vec![conflict.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let stored = storage.get_rule(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.sources.len(), 1);
        assert_eq!(stored.status, RuleStatus::Draft);

        let open = storage.open_conflicts_for_rule(&b.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].rule_ids.len(), 2);
    }

    #[tokio::test]
    async fn transitions_are_validated_and_recorded() {
        let storage = test_storage().await;
        let rule = grounded_rule(&storage, "vat", "25%", AuthorityLevel::PrimaryLegislation).await;
        storage
            .apply_composition(&CompositionWrite {
                new_rules: vec![rule.clone()],
                ..Default::default()
            })
            .await
            .unwrap();

        let err = storage
            .transition_rule(&rule.id, RuleStatus::Published, "test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegTruthError::InvalidTransition { .. }));

        storage
            .transition_rule(&rule.id, RuleStatus::Approved, "review", Some("auto"))
            .await
            .unwrap();
        storage
            .transition_rule(&rule.id, RuleStatus::Published, "release", None)
            .await
            .unwrap();

        let history = storage.rule_transitions(&rule.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].1, RuleStatus::Published);

        // Published assertions and grounding are frozen.
        let result = storage
            .conn
            .execute(
                "UPDATE rules SET value = '99%' WHERE id = ?1",
                params![rule.id.as_str()],
            )
            .await;
        assert!(result.is_err());
        let extra = grounded_rule(&storage, "vat", "25%", AuthorityLevel::PrimaryLegislation).await;
        let result = storage
            .apply_composition(&CompositionWrite {
                attach_sources: vec![(rule.id.clone(), extra.sources[0].clone())],
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resolution_is_applied_once() {
        let storage = test_storage().await;
        let a = grounded_rule(&storage, "vat", "25%", AuthorityLevel::PrimaryLegislation).await;
        let b = grounded_rule(&storage, "vat", "13%", AuthorityLevel::SecondaryGuidance).await;
        let conflict_id = Uuid::now_v7().to_string();
        storage
            .apply_composition(&CompositionWrite {
                new_rules: vec![a.clone(), b.clone()],
                new_conflicts: vec![Conflict {
                    id: conflict_id.clone(),
                    concept: "vat".into(),
                    effective_from: a.effective_from,
                    rule_ids: vec![a.id.clone(), b.id.clone()],
                    status: ConflictStatus::Open,
                    resolution: None,
                    created_at: Utc::now(),
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        let write = ResolutionWrite {
            conflict_id: conflict_id.clone(),
            audit: ResolutionAudit {
                winner: a.id.clone(),
                losers: vec![b.id.clone()],
                deciding_criterion: Some(TieBreak::Authority),
                criteria: vec![TieBreak::Authority],
                inputs: vec![a.snapshot(), b.snapshot()],
                decided_by: "arbiter".into(),
                resolved_at: Utc::now(),
            },
            approve_winner: true,
        };
        assert!(storage.apply_resolution(&write).await.unwrap());
        assert!(!storage.apply_resolution(&write).await.unwrap());

        let winner = storage.get_rule(&a.id).await.unwrap().unwrap();
        let loser = storage.get_rule(&b.id).await.unwrap().unwrap();
        assert_eq!(winner.status, RuleStatus::Approved);
        assert_eq!(loser.status, RuleStatus::Deprecated);

        let conflict = storage.get_conflict(&conflict_id).await.unwrap().unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.resolution.unwrap().winner, a.id);
        assert!(storage.open_conflicts_for_rule(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn published_rules_follow_retrieval_order() {
        let storage = test_storage().await;
        let mut low = grounded_rule(&storage, "vat", "13%", AuthorityLevel::SecondaryGuidance).await;
        low.confidence = 0.99;
        let high = grounded_rule(&storage, "vat", "25%", AuthorityLevel::PrimaryLegislation).await;
        storage
            .apply_composition(&CompositionWrite {
                new_rules: vec![low.clone(), high.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        for id in [&low.id, &high.id] {
            storage
                .transition_rule(id, RuleStatus::Approved, "test", None)
                .await
                .unwrap();
            storage
                .transition_rule(id, RuleStatus::Published, "test", None)
                .await
                .unwrap();
        }

        let published = storage.published_rules(Some("vat")).await.unwrap();
        let ids: Vec<_> = published.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![high.id.as_str(), low.id.as_str()]);
    }

    async fn approved_rule(storage: &Storage, value: &str) -> Rule {
        let rule = grounded_rule(storage, "vat", value, AuthorityLevel::PrimaryLegislation).await;
        storage
            .apply_composition(&CompositionWrite {
                new_rules: vec![rule.clone()],
                ..Default::default()
            })
            .await
            .unwrap();
        storage
            .transition_rule(&rule.id, RuleStatus::Approved, "test", None)
            .await
            .unwrap();
        rule
    }

    fn supersedes(from: &Rule, to: &str) -> GraphEdge {
        GraphEdge {
            from_rule: from.id.clone(),
            to_rule: to.to_string(),
            kind: EdgeKind::Supersedes,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publication_is_written_once() {
        let storage = test_storage().await;
        let old = approved_rule(&storage, "23%").await;
        storage
            .transition_rule(&old.id, RuleStatus::Published, "test", None)
            .await
            .unwrap();
        let new = approved_rule(&storage, "25%").await;

        let write = PublicationWrite {
            rule_id: new.id.clone(),
            actor: "release".into(),
            edges: vec![supersedes(&new, &old.id)],
            signal: serde_json::json!({ "value": "25%" }),
        };
        assert!(storage.publish_rule(&write).await.unwrap());
        assert!(!storage.publish_rule(&write).await.unwrap());

        assert_eq!(storage.get_rule(&new.id).await.unwrap().unwrap().status, RuleStatus::Published);
        assert!(storage.release_signalled(&new.id).await.unwrap());
        assert_eq!(storage.release_events_since(0, 10).await.unwrap().len(), 1);
        assert_eq!(storage.edges_for_rule(&old.id).await.unwrap().len(), 1);
        let events = storage.events_for("rule", &new.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "published");
    }

    #[tokio::test]
    async fn failed_publication_leaves_the_rule_approved() {
        let storage = test_storage().await;
        let rule = approved_rule(&storage, "25%").await;

        let write = PublicationWrite {
            rule_id: rule.id.clone(),
            actor: "release".into(),
            edges: vec![supersedes(&rule, "no-such-rule")],
            signal: serde_json::json!({ "value": "25%" }),
        };
        assert!(storage.publish_rule(&write).await.is_err());

        assert_eq!(storage.get_rule(&rule.id).await.unwrap().unwrap().status, RuleStatus::Approved);
        assert!(!storage.release_signalled(&rule.id).await.unwrap());
        assert_eq!(storage.rule_transitions(&rule.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn published_rule_without_signal_is_completed() {
        let storage = test_storage().await;
        let rule = approved_rule(&storage, "25%").await;
        storage
            .transition_rule(&rule.id, RuleStatus::Published, "test", None)
            .await
            .unwrap();

        let write = PublicationWrite {
            rule_id: rule.id.clone(),
            actor: "release".into(),
            edges: Vec::new(),
            signal: serde_json::json!({ "value": "25%" }),
        };
        assert!(storage.publish_rule(&write).await.unwrap());
        assert!(storage.release_signalled(&rule.id).await.unwrap());
    }
}
