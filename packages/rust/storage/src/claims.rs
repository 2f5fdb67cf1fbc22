//! Atomic claim operations (append-only).

use libsql::params;
use regtruth_shared::{AtomicClaim, RegTruthError, Result};

use crate::{Storage, date_str, get_opt_date, get_opt_string, get_parsed, get_string, get_ts, ts};

const CLAIM_COLUMNS: &str = "c.id, c.evidence_id, c.concept, c.exact_quote, c.normalized_value, \
     c.value_type, c.confidence, c.legal_reference, c.effective_from, c.authority, c.created_at";

/// A claim joined with the URL of the evidence it quotes.
#[derive(Debug, Clone)]
pub struct GroundedClaim {
    pub claim: AtomicClaim,
    pub url: String,
}

impl Storage {
    /// Insert a claim. Re-extracting the same quote from the same evidence
    /// returns the existing id instead of creating a duplicate.
    pub async fn insert_claim(&self, claim: &AtomicClaim) -> Result<String> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO atomic_claims (id, evidence_id, concept, exact_quote, normalized_value,
                    value_type, confidence, legal_reference, effective_from, authority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(evidence_id, concept, exact_quote, normalized_value) DO NOTHING
                 RETURNING id",
                params![
                    claim.id.as_str(),
                    claim.evidence_id.as_str(),
                    claim.concept.as_str(),
                    claim.exact_quote.as_str(),
                    claim.normalized_value.as_str(),
                    claim.value_type.as_str(),
                    claim.confidence,
                    claim.legal_reference.as_deref(),
                    date_str(claim.effective_from),
                    claim.authority.as_str(),
                    ts(&claim.created_at),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;

        if let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            return get_string(&row, 0);
        }
        drop(rows);

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM atomic_claims
                 WHERE evidence_id = ?1 AND concept = ?2 AND exact_quote = ?3 AND normalized_value = ?4",
                params![
                    claim.evidence_id.as_str(),
                    claim.concept.as_str(),
                    claim.exact_quote.as_str(),
                    claim.normalized_value.as_str(),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => get_string(&row, 0),
            None => Err(RegTruthError::Storage(format!(
                "claim for evidence {} vanished after conflict",
                claim.evidence_id
            ))),
        }
    }

    pub async fn get_claim(&self, id: &str) -> Result<Option<GroundedClaim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS}, e.url FROM atomic_claims c
             JOIN evidence e ON e.id = c.evidence_id WHERE c.id = ?1"
        );
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(row_to_grounded(&row)?)),
            None => Ok(None),
        }
    }

    /// All claims extracted from one capture.
    pub async fn claims_for_evidence(&self, evidence_id: &str) -> Result<Vec<GroundedClaim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS}, e.url FROM atomic_claims c
             JOIN evidence e ON e.id = c.evidence_id
             WHERE c.evidence_id = ?1 ORDER BY c.created_at, c.id"
        );
        self.query_grounded(&sql, evidence_id).await
    }

    /// All claims ever extracted for a concept, across evidence.
    pub async fn claims_for_concept(&self, concept: &str) -> Result<Vec<GroundedClaim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS}, e.url FROM atomic_claims c
             JOIN evidence e ON e.id = c.evidence_id
             WHERE c.concept = ?1 ORDER BY c.created_at, c.id"
        );
        self.query_grounded(&sql, concept).await
    }

    pub async fn count_claims(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM atomic_claims", params![])
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => row.get::<i64>(0).map_err(RegTruthError::storage),
            None => Ok(0),
        }
    }

    async fn query_grounded(&self, sql: &str, key: &str) -> Result<Vec<GroundedClaim>> {
        let mut rows = self
            .conn
            .query(sql, params![key])
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(row_to_grounded(&row)?);
        }
        Ok(results)
    }
}

fn row_to_grounded(row: &libsql::Row) -> Result<GroundedClaim> {
    let claim = AtomicClaim {
        id: get_string(row, 0)?,
        evidence_id: get_string(row, 1)?,
        concept: get_string(row, 2)?,
        exact_quote: get_string(row, 3)?,
        normalized_value: get_string(row, 4)?,
        value_type: get_parsed(row, 5)?,
        confidence: row.get::<f64>(6).map_err(RegTruthError::storage)?,
        legal_reference: get_opt_string(row, 7),
        effective_from: get_opt_date(row, 8)?,
        authority: get_parsed(row, 9)?,
        created_at: get_ts(row, 10)?,
    };
    Ok(GroundedClaim {
        claim,
        url: get_string(row, 11)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::evidence::tests::new_evidence;
    use crate::test_support::test_storage;
    use chrono::{NaiveDate, Utc};
    use regtruth_shared::{AuthorityLevel, ValueType};
    use uuid::Uuid;

    pub(crate) fn claim(evidence_id: &str, concept: &str, value: &str) -> AtomicClaim {
        AtomicClaim {
            id: Uuid::now_v7().to_string(),
            evidence_id: evidence_id.into(),
            concept: concept.into(),
            exact_quote: format!("The rate is {value}."),
            normalized_value: value.into(),
            value_type: ValueType::NumericThreshold,
            confidence: 0.9,
            legal_reference: Some("Article 38".into()),
            effective_from: NaiveDate::from_ymd_opt(2025, 1, 1),
            authority: AuthorityLevel::PrimaryLegislation,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_claim_returns_existing_id() {
        let storage = test_storage().await;
        let ev = storage
            .upsert_evidence(&new_evidence("https://example.com/law", "The rate is 25%."))
            .await
            .unwrap();

        let first = claim(&ev.id, "vat-standard-rate", "25%");
        let id1 = storage.insert_claim(&first).await.unwrap();
        assert_eq!(id1, first.id);

        let dup = claim(&ev.id, "vat-standard-rate", "25%");
        let id2 = storage.insert_claim(&dup).await.unwrap();
        assert_eq!(id2, id1);

        let by_concept = storage.claims_for_concept("vat-standard-rate").await.unwrap();
        assert_eq!(by_concept.len(), 1);
        assert_eq!(by_concept[0].url, "https://example.com/law");
        assert_eq!(
            by_concept[0].claim.effective_from,
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
    }

    #[tokio::test]
    async fn claims_cannot_be_edited() {
        let storage = test_storage().await;
        let ev = storage
            .upsert_evidence(&new_evidence("https://example.com/law", "x"))
            .await
            .unwrap();
        let id = storage
            .insert_claim(&claim(&ev.id, "c", "1"))
            .await
            .unwrap();

        let result = storage
            .conn
            .execute(
                "UPDATE atomic_claims SET normalized_value = '2' WHERE id = ?1",
                params![id.as_str()],
            )
            .await;
        assert!(result.is_err());
        assert_eq!(storage.claims_for_evidence(&ev.id).await.unwrap().len(), 1);
    }
}
