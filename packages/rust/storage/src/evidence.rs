//! Evidence operations. Captures are append-only; only the verification
//! timestamp, staleness flag and OCR text change after insert.

use chrono::{DateTime, Utc};
use libsql::params;
use regtruth_shared::{ContentClass, Evidence, RegTruthError, Result, StalenessStatus};
use uuid::Uuid;

use crate::{Storage, get_opt_string, get_parsed, get_string, get_ts, ts};

const EVIDENCE_COLUMNS: &str = "id, source_id, url, content_hash, raw_content, content_type, \
     content_class, fetched_at, last_verified_at, staleness, ocr_text";

/// A fetched document about to become evidence.
#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub source_id: String,
    pub url: String,
    pub content_hash: String,
    pub raw_content: Vec<u8>,
    pub content_type: Option<String>,
    pub content_class: ContentClass,
    pub fetched_at: DateTime<Utc>,
}

/// Result of an evidence upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceUpsert {
    pub id: String,
    /// `false` when `(url, content_hash)` already existed and was only re-verified.
    pub created: bool,
}

/// Evidence whose last verification is older than its freshness window allows.
#[derive(Debug, Clone)]
pub struct StaleCandidate {
    pub evidence_id: String,
    pub item_id: String,
    pub source_id: String,
    pub url: String,
    pub last_verified_at: DateTime<Utc>,
}

impl Storage {
    /// Insert a capture, or refresh `last_verified_at` on the existing
    /// `(url, content_hash)` row. Never duplicates content.
    pub async fn upsert_evidence(&self, new: &NewEvidence) -> Result<EvidenceUpsert> {
        self.check_writable()?;
        let candidate_id = Uuid::now_v7().to_string();
        let fetched = ts(&new.fetched_at);

        let mut rows = self
            .conn
            .query(
                "INSERT INTO evidence (id, source_id, url, content_hash, raw_content, content_type,
                    content_class, fetched_at, last_verified_at, staleness)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 'FRESH')
                 ON CONFLICT(url, content_hash) DO UPDATE SET
                    last_verified_at = excluded.last_verified_at,
                    staleness = 'FRESH'
                 RETURNING id",
                params![
                    candidate_id.as_str(),
                    new.source_id.as_str(),
                    new.url.as_str(),
                    new.content_hash.as_str(),
                    new.raw_content.clone(),
                    new.content_type.as_deref(),
                    new.content_class.as_str(),
                    fetched.as_str(),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let row = rows
            .next()
            .await
            .map_err(RegTruthError::storage)?
            .ok_or_else(|| RegTruthError::Storage("evidence upsert returned no row".into()))?;
        let id = get_string(&row, 0)?;
        let created = id == candidate_id;

        tracing::debug!(evidence_id = %id, url = %new.url, created, "evidence upserted");
        Ok(EvidenceUpsert { id, created })
    }

    pub async fn get_evidence(&self, id: &str) -> Result<Option<Evidence>> {
        let sql = format!("SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(RegTruthError::storage)?;

        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(row_to_evidence(&row)?)),
            None => Ok(None),
        }
    }

    /// Every captured version of a URL, oldest first.
    pub async fn evidence_versions(&self, url: &str) -> Result<Vec<Evidence>> {
        let sql =
            format!("SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE url = ?1 ORDER BY fetched_at");
        let mut rows = self
            .conn
            .query(&sql, params![url])
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(row_to_evidence(&row)?);
        }
        Ok(results)
    }

    /// Content hash of the newest capture of `url`, if any.
    pub async fn latest_content_hash(&self, url: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content_hash FROM evidence WHERE url = ?1
                 ORDER BY fetched_at DESC LIMIT 1",
                params![url],
            )
            .await
            .map_err(RegTruthError::storage)?;

        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(get_string(&row, 0)?)),
            None => Ok(None),
        }
    }

    /// Attach OCR output to a scanned capture. The raw bytes stay untouched.
    pub async fn set_ocr_text(&self, evidence_id: &str, text: &str) -> Result<()> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE evidence SET ocr_text = ?1 WHERE id = ?2",
                params![text, evidence_id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        if affected == 0 {
            return Err(RegTruthError::NotFound(format!("evidence {evidence_id}")));
        }
        Ok(())
    }

    /// Fresh evidence last verified before `cutoff`, restricted to URLs whose
    /// discovered item carries the given freshness risk.
    pub async fn stale_candidates(
        &self,
        freshness_risk: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleCandidate>> {
        let mut rows = self
            .conn
            .query(
                "SELECT e.id, d.id, d.source_id, d.url, e.last_verified_at
                 FROM evidence e
                 JOIN discovered_items d ON d.evidence_id = e.id
                 WHERE e.staleness = 'FRESH'
                   AND d.freshness_risk = ?1
                   AND e.last_verified_at < ?2
                 ORDER BY e.last_verified_at",
                params![freshness_risk, ts(&cutoff)],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(StaleCandidate {
                evidence_id: get_string(&row, 0)?,
                item_id: get_string(&row, 1)?,
                source_id: get_string(&row, 2)?,
                url: get_string(&row, 3)?,
                last_verified_at: get_ts(&row, 4)?,
            });
        }
        Ok(results)
    }

    pub async fn set_staleness(&self, evidence_id: &str, staleness: StalenessStatus) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE evidence SET staleness = ?1 WHERE id = ?2",
                params![staleness.as_str(), evidence_id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }

    /// Evidence counts grouped by staleness flag.
    pub async fn count_evidence_by_staleness(&self) -> Result<Vec<(String, i64)>> {
        self.count_grouped("evidence", "staleness").await
    }
}

fn row_to_evidence(row: &libsql::Row) -> Result<Evidence> {
    Ok(Evidence {
        id: get_string(row, 0)?,
        source_id: get_string(row, 1)?,
        url: get_string(row, 2)?,
        content_hash: get_string(row, 3)?,
        raw_content: row.get::<Vec<u8>>(4).map_err(RegTruthError::storage)?,
        content_type: get_opt_string(row, 5),
        content_class: get_parsed(row, 6)?,
        fetched_at: get_ts(row, 7)?,
        last_verified_at: get_ts(row, 8)?,
        staleness: get_parsed(row, 9)?,
        ocr_text: get_opt_string(row, 10),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use regtruth_shared::sha256_hex;

    pub(crate) fn new_evidence(url: &str, body: &str) -> NewEvidence {
        NewEvidence {
            source_id: "src".into(),
            url: url.into(),
            content_hash: sha256_hex(body.as_bytes()),
            raw_content: body.as_bytes().to_vec(),
            content_type: Some("text/html".into()),
            content_class: ContentClass::Html,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn same_content_reverifies_instead_of_duplicating() {
        let storage = test_storage().await;
        let first = storage
            .upsert_evidence(&new_evidence("https://example.com/a", "<p>v1</p>"))
            .await
            .unwrap();
        assert!(first.created);

        let mut again = new_evidence("https://example.com/a", "<p>v1</p>");
        again.fetched_at = Utc::now() + chrono::Duration::seconds(5);
        let second = storage.upsert_evidence(&again).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);

        let stored = storage.get_evidence(&first.id).await.unwrap().unwrap();
        assert!(stored.last_verified_at > stored.fetched_at);
        assert_eq!(stored.raw_content, b"<p>v1</p>");
    }

    #[tokio::test]
    async fn changed_content_creates_new_version() {
        let storage = test_storage().await;
        let url = "https://example.com/a";
        storage.upsert_evidence(&new_evidence(url, "v1")).await.unwrap();
        let v2 = storage.upsert_evidence(&new_evidence(url, "v2")).await.unwrap();
        assert!(v2.created);

        let versions = storage.evidence_versions(url).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(
            storage.latest_content_hash(url).await.unwrap(),
            Some(sha256_hex(b"v2"))
        );
    }

    #[tokio::test]
    async fn core_fields_are_immutable() {
        let storage = test_storage().await;
        let up = storage
            .upsert_evidence(&new_evidence("https://example.com/a", "v1"))
            .await
            .unwrap();

        let result = storage
            .conn
            .execute(
                "UPDATE evidence SET raw_content = x'00' WHERE id = ?1",
                params![up.id.as_str()],
            )
            .await;
        assert!(result.is_err());

        let result = storage
            .conn
            .execute("DELETE FROM evidence WHERE id = ?1", params![up.id.as_str()])
            .await;
        assert!(result.is_err());

        storage.set_ocr_text(&up.id, "recovered").await.unwrap();
        let stored = storage.get_evidence(&up.id).await.unwrap().unwrap();
        assert_eq!(stored.ocr_text.as_deref(), Some("recovered"));
    }
}
