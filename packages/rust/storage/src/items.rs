//! Discovered-item operations: the shared discovery surface.

use chrono::Utc;
use libsql::params;
use regtruth_shared::{DiscoveredItem, ItemState, ItemStatus, RegTruthError, Result};

use crate::{
    Storage, get_json, get_opt_string, get_parsed, get_string, get_ts, to_json, ts,
};

const ITEM_COLUMNS: &str = "id, source_id, url, canonical_url, state_json, method, content_hash, \
     evidence_id, retry_count, crawl_depth, change_frequency, freshness_risk, backfill_run_id, \
     discovered_at, updated_at";

impl Storage {
    /// Insert an item unless `(source_id, canonical_url)` is already known.
    ///
    /// Returns `true` if a new row was created. An existing row is never
    /// overwritten by a second discovery.
    pub async fn insert_item_if_absent(&self, item: &DiscoveredItem) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "INSERT INTO discovered_items (id, source_id, url, canonical_url, status, state_json,
                    method, content_hash, evidence_id, retry_count, crawl_depth, change_frequency,
                    freshness_risk, backfill_run_id, discovered_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(source_id, canonical_url) DO NOTHING",
                params![
                    item.id.as_str(),
                    item.source_id.as_str(),
                    item.url.as_str(),
                    item.canonical_url.as_str(),
                    item.status().as_str(),
                    to_json(&item.state)?,
                    item.method.as_str(),
                    item.content_hash.as_deref(),
                    item.evidence_id.as_deref(),
                    i64::from(item.retry_count),
                    i64::from(item.crawl_depth),
                    item.change_frequency.as_str(),
                    item.freshness_risk.as_str(),
                    item.backfill_run_id.as_deref(),
                    ts(&item.discovered_at),
                    ts(&item.updated_at),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(affected == 1)
    }

    /// Whether `(source_id, canonical_url)` is already on the discovery surface.
    pub async fn item_exists(&self, source_id: &str, canonical_url: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM discovered_items WHERE source_id = ?1 AND canonical_url = ?2",
                params![source_id, canonical_url],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(rows.next().await.map_err(RegTruthError::storage)?.is_some())
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<DiscoveredItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM discovered_items WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(RegTruthError::storage)?;

        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_item_by_url(
        &self,
        source_id: &str,
        canonical_url: &str,
    ) -> Result<Option<DiscoveredItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM discovered_items WHERE source_id = ?1 AND canonical_url = ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![source_id, canonical_url])
            .await
            .map_err(RegTruthError::storage)?;

        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    /// Oldest items in `status`, across all sources.
    pub async fn list_items_by_status(
        &self,
        status: ItemStatus,
        limit: usize,
    ) -> Result<Vec<DiscoveredItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM discovered_items WHERE status = ?1
             ORDER BY discovered_at LIMIT ?2"
        );
        let mut rows = self
            .conn
            .query(&sql, params![status.as_str(), limit as i64])
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(row_to_item(&row)?);
        }
        Ok(results)
    }

    /// Items created by one backfill run.
    pub async fn count_items_for_run(&self, run_id: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM discovered_items WHERE backfill_run_id = ?1",
                params![run_id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => row.get::<i64>(0).map_err(RegTruthError::storage),
            None => Ok(0),
        }
    }

    /// Move an item to a new pipeline state. Terminal states are never left.
    pub async fn set_item_state(
        &self,
        id: &str,
        state: &ItemState,
        content_hash: Option<&str>,
        retry_count: u32,
    ) -> Result<()> {
        self.check_writable()?;
        let evidence_id = match state {
            ItemState::Fetched { evidence_id } | ItemState::Processed { evidence_id } => {
                Some(evidence_id.as_str())
            }
            _ => None,
        };
        let affected = self
            .conn
            .execute(
                "UPDATE discovered_items SET
                    status = ?1,
                    state_json = ?2,
                    content_hash = COALESCE(?3, content_hash),
                    evidence_id = COALESCE(?4, evidence_id),
                    retry_count = ?5,
                    updated_at = ?6
                 WHERE id = ?7 AND status NOT IN ('PROCESSED', 'SKIPPED', 'FAILED')",
                params![
                    state.status().as_str(),
                    to_json(state)?,
                    content_hash,
                    evidence_id,
                    i64::from(retry_count),
                    ts(&Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;

        if affected == 0 {
            tracing::debug!(item_id = id, to = %state.status(), "item missing or already terminal");
        }
        Ok(())
    }

    /// Point an item at a newer capture of its URL, whatever its state.
    ///
    /// Staleness tracking follows the item's evidence link, so a re-verify
    /// that finds changed content must move the link to the new capture.
    pub async fn relink_item_evidence(
        &self,
        id: &str,
        evidence_id: &str,
        content_hash: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE discovered_items SET
                    evidence_id = ?1,
                    content_hash = ?2,
                    state_json = CASE
                        WHEN json_extract(state_json, '$.evidence_id') IS NULL THEN state_json
                        ELSE json_set(state_json, '$.evidence_id', ?1)
                    END,
                    updated_at = ?3
                 WHERE id = ?4",
                params![evidence_id, content_hash, ts(&Utc::now()), id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        if affected == 0 {
            return Err(RegTruthError::NotFound(format!("item {id}")));
        }
        Ok(())
    }

    /// Item counts grouped by status (dashboard).
    pub async fn count_items_by_status(&self) -> Result<Vec<(String, i64)>> {
        self.count_grouped("discovered_items", "status").await
    }
}

fn row_to_item(row: &libsql::Row) -> Result<DiscoveredItem> {
    Ok(DiscoveredItem {
        id: get_string(row, 0)?,
        source_id: get_string(row, 1)?,
        url: get_string(row, 2)?,
        canonical_url: get_string(row, 3)?,
        state: get_json(row, 4)?,
        method: get_parsed(row, 5)?,
        content_hash: get_opt_string(row, 6),
        evidence_id: get_opt_string(row, 7),
        retry_count: row.get::<i64>(8).map_err(RegTruthError::storage)? as u32,
        crawl_depth: row.get::<i64>(9).map_err(RegTruthError::storage)? as u32,
        change_frequency: get_parsed(row, 10)?,
        freshness_risk: get_parsed(row, 11)?,
        backfill_run_id: get_opt_string(row, 12),
        discovered_at: get_ts(row, 13)?,
        updated_at: get_ts(row, 14)?,
    })
}
