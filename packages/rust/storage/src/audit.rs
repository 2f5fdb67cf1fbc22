//! Audit trail, validation rejections and the release outbox.

use chrono::{DateTime, Utc};
use libsql::params;
use regtruth_shared::{RegTruthError, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::{Storage, get_string, get_ts, ts};

/// One stage decision about one entity.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub action: String,
    pub detail: Option<serde_json::Value>,
}

/// A payload that failed validation; it is never retried.
#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub id: String,
    pub stage: String,
    pub entity_id: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Outbox row written when a rule is published.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseEvent {
    pub id: i64,
    pub rule_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn record_event(
        &self,
        stage: &str,
        entity_kind: &str,
        entity_id: &str,
        action: &str,
        detail: Option<serde_json::Value>,
    ) -> Result<()> {
        self.check_writable()?;
        let detail = detail.map(|d| d.to_string());
        self.conn
            .execute(
                "INSERT INTO audit_events (at, stage, entity_kind, entity_id, action, detail_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![ts(&Utc::now()), stage, entity_kind, entity_id, action, detail],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }

    /// Audit trail of one entity, oldest first.
    pub async fn events_for(&self, entity_kind: &str, entity_id: &str) -> Result<Vec<AuditEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT at, stage, entity_kind, entity_id, action, detail_json FROM audit_events
                 WHERE entity_kind = ?1 AND entity_id = ?2 ORDER BY id",
                params![entity_kind, entity_id],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            let detail = row
                .get::<String>(5)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok());
            results.push(AuditEvent {
                at: get_ts(&row, 0)?,
                stage: get_string(&row, 1)?,
                entity_kind: get_string(&row, 2)?,
                entity_id: get_string(&row, 3)?,
                action: get_string(&row, 4)?,
                detail,
            });
        }
        Ok(results)
    }

    pub async fn insert_rejection(
        &self,
        stage: &str,
        entity_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO rejections (id, stage, entity_id, reason, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    stage,
                    entity_id,
                    reason,
                    payload.to_string(),
                    ts(&Utc::now()),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        tracing::warn!(stage, entity_id, reason, "payload rejected");
        Ok(id)
    }

    pub async fn list_rejections(&self, limit: usize) -> Result<Vec<Rejection>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, stage, entity_id, reason, payload, created_at FROM rejections
                 ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            let raw = get_string(&row, 4)?;
            results.push(Rejection {
                id: get_string(&row, 0)?,
                stage: get_string(&row, 1)?,
                entity_id: get_string(&row, 2)?,
                reason: get_string(&row, 3)?,
                payload: serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
                created_at: get_ts(&row, 5)?,
            });
        }
        Ok(results)
    }

    /// Outbox rows with `id > after`, oldest first.
    pub async fn release_events_since(&self, after: i64, limit: usize) -> Result<Vec<ReleaseEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, rule_id, kind, payload_json, created_at FROM release_events
                 WHERE id > ?1 ORDER BY id LIMIT ?2",
                params![after, limit as i64],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            let raw = get_string(&row, 3)?;
            results.push(ReleaseEvent {
                id: row.get::<i64>(0).map_err(RegTruthError::storage)?,
                rule_id: get_string(&row, 1)?,
                kind: get_string(&row, 2)?,
                payload: serde_json::from_str(&raw)
                    .map_err(|e| RegTruthError::Storage(format!("corrupt release payload: {e}")))?,
                created_at: get_ts(&row, 4)?,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use serde_json::json;

    #[tokio::test]
    async fn audit_trail_keeps_order_and_detail() {
        let storage = test_storage().await;
        storage
            .record_event("review", "rule", "r1", "pending_review", Some(json!({"confidence": 0.5})))
            .await
            .unwrap();
        storage
            .record_event("override", "rule", "r1", "approved", None)
            .await
            .unwrap();

        let events = storage.events_for("rule", "r1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail, Some(json!({"confidence": 0.5})));
        assert_eq!(events[1].action, "approved");
    }

    #[tokio::test]
    async fn rejections_are_listed() {
        let storage = test_storage().await;
        storage
            .insert_rejection("extract", "ev-1", "quote not found in text", &json!({"quote": "x"}))
            .await
            .unwrap();
        let rejections = storage.list_rejections(10).await.unwrap();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].payload["quote"], "x");
    }
}
