//! Backfill run records and scheduled-discovery cursors.

use chrono::{DateTime, Utc};
use libsql::params;
use regtruth_shared::{BackfillRun, BackfillStatus, RegTruthError, Result};

use crate::{Storage, get_json, get_opt_ts, get_parsed, get_string, get_ts, to_json, ts};

const RUN_COLUMNS: &str = "id, params_json, status, discovered_count, queued_count, \
     skipped_count, error_count, errors_json, created_at, finished_at";

impl Storage {
    pub async fn insert_backfill_run(&self, run: &BackfillRun) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO backfill_runs (id, params_json, status, discovered_count, queued_count,
                    skipped_count, error_count, errors_json, created_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.id.as_str(),
                    to_json(&run.params)?,
                    run.status.as_str(),
                    run.discovered_count as i64,
                    run.queued_count as i64,
                    run.skipped_count as i64,
                    run.error_count as i64,
                    to_json(&run.errors)?,
                    ts(&run.created_at),
                    run.finished_at.as_ref().map(ts),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }

    /// Persist counters, error log and status. A cancelled run keeps its
    /// CANCELLED status even if the worker writes a late progress update.
    pub async fn update_backfill_run(&self, run: &BackfillRun) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE backfill_runs SET
                    status = CASE WHEN status = 'CANCELLED' THEN status ELSE ?1 END,
                    discovered_count = ?2,
                    queued_count = ?3,
                    skipped_count = ?4,
                    error_count = ?5,
                    errors_json = ?6,
                    finished_at = COALESCE(finished_at, ?7)
                 WHERE id = ?8",
                params![
                    run.status.as_str(),
                    run.discovered_count as i64,
                    run.queued_count as i64,
                    run.skipped_count as i64,
                    run.error_count as i64,
                    to_json(&run.errors)?,
                    run.finished_at.as_ref().map(ts),
                    run.id.as_str(),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }

    pub async fn get_backfill_run(&self, id: &str) -> Result<Option<BackfillRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM backfill_runs WHERE id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(RegTruthError::storage)?;

        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    /// Most recent runs first.
    pub async fn list_backfill_runs(&self, limit: usize) -> Result<Vec<BackfillRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM backfill_runs ORDER BY created_at DESC LIMIT ?1");
        let mut rows = self
            .conn
            .query(&sql, params![limit as i64])
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    /// Current status only; polled between batches for cooperative cancel.
    pub async fn backfill_run_status(&self, id: &str) -> Result<BackfillStatus> {
        let mut rows = self
            .conn
            .query("SELECT status FROM backfill_runs WHERE id = ?1", params![id])
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => get_parsed(&row, 0),
            None => Err(RegTruthError::NotFound(format!("backfill run {id}"))),
        }
    }

    /// Request cancellation. Returns `false` if the run had already finished.
    pub async fn cancel_backfill_run(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE backfill_runs SET status = 'CANCELLED', finished_at = ?1
                 WHERE id = ?2 AND status IN ('PENDING', 'RUNNING')",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        if affected == 0 && self.get_backfill_run(id).await?.is_none() {
            return Err(RegTruthError::NotFound(format!("backfill run {id}")));
        }
        Ok(affected == 1)
    }

    // -----------------------------------------------------------------------
    // Scheduled cursors
    // -----------------------------------------------------------------------

    /// When the scheduled producer last read `source_id`.
    pub async fn last_scheduled_at(&self, source_id: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_scheduled_at FROM source_cursors WHERE source_id = ?1",
                params![source_id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(get_ts(&row, 0)?)),
            None => Ok(None),
        }
    }

    pub async fn record_scheduled_pass(
        &self,
        source_id: &str,
        at: DateTime<Utc>,
        discovered: usize,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO source_cursors (source_id, last_scheduled_at, last_discovered)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_id) DO UPDATE SET
                    last_scheduled_at = excluded.last_scheduled_at,
                    last_discovered = excluded.last_discovered",
                params![source_id, ts(&at), discovered as i64],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }
}

fn row_to_run(row: &libsql::Row) -> Result<BackfillRun> {
    Ok(BackfillRun {
        id: get_string(row, 0)?,
        params: get_json(row, 1)?,
        status: get_parsed(row, 2)?,
        discovered_count: row.get::<i64>(3).map_err(RegTruthError::storage)? as usize,
        queued_count: row.get::<i64>(4).map_err(RegTruthError::storage)? as usize,
        skipped_count: row.get::<i64>(5).map_err(RegTruthError::storage)? as usize,
        error_count: row.get::<i64>(6).map_err(RegTruthError::storage)? as usize,
        errors: get_json(row, 7)?,
        created_at: get_ts(row, 8)?,
        finished_at: get_opt_ts(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use regtruth_shared::{BackfillError, BackfillMode, BackfillParams};
    use uuid::Uuid;

    fn run() -> BackfillRun {
        BackfillRun {
            id: Uuid::now_v7().to_string(),
            params: BackfillParams {
                sources: vec!["tax-authority".into()],
                mode: BackfillMode::Sitemap,
                date_from: None,
                date_to: None,
                max_urls: 50,
                max_urls_per_source: 50,
                delay_ms: 0,
                dry_run: false,
            },
            status: BackfillStatus::Running,
            discovered_count: 0,
            queued_count: 0,
            skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn run_roundtrip_with_errors() {
        let storage = test_storage().await;
        let mut r = run();
        storage.insert_backfill_run(&r).await.unwrap();

        r.discovered_count = 3;
        r.queued_count = 1;
        r.skipped_count = 2;
        r.error_count = 1;
        r.errors.push(BackfillError {
            source_id: "tax-authority".into(),
            url: Some("https://example.com/sitemap.xml".into()),
            phase: "listing".into(),
            message: "HTTP 503".into(),
            at: Utc::now(),
        });
        r.status = BackfillStatus::Completed;
        r.finished_at = Some(Utc::now());
        storage.update_backfill_run(&r).await.unwrap();

        let stored = storage.get_backfill_run(&r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackfillStatus::Completed);
        assert_eq!(stored.queued_count, 1);
        assert_eq!(stored.errors.len(), 1);
        assert_eq!(stored.params, r.params);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn cancel_is_sticky() {
        let storage = test_storage().await;
        let mut r = run();
        storage.insert_backfill_run(&r).await.unwrap();

        assert!(storage.cancel_backfill_run(&r.id).await.unwrap());
        assert!(!storage.cancel_backfill_run(&r.id).await.unwrap());

        r.status = BackfillStatus::Running;
        storage.update_backfill_run(&r).await.unwrap();
        assert_eq!(
            storage.backfill_run_status(&r.id).await.unwrap(),
            BackfillStatus::Cancelled
        );
        assert!(matches!(
            storage.cancel_backfill_run("missing").await,
            Err(RegTruthError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cursor_upserts() {
        let storage = test_storage().await;
        assert!(storage.last_scheduled_at("src").await.unwrap().is_none());
        let t1 = Utc::now();
        storage.record_scheduled_pass("src", t1, 4).await.unwrap();
        let t2 = t1 + chrono::Duration::hours(1);
        storage.record_scheduled_pass("src", t2, 0).await.unwrap();
        let last = storage.last_scheduled_at("src").await.unwrap().unwrap();
        assert_eq!(last.timestamp(), t2.timestamp());
    }
}
