//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding the discovery
//! surface, immutable evidence, claims, rules, conflicts, backfill runs,
//! the knowledge graph and the durable job queues.
//!
//! **Concurrency rules:**
//! - every write is a uniqueness-constrained upsert enforced by the schema,
//!   so concurrent producers converge on one row without explicit locks
//! - multi-statement writes run in a transaction on a dedicated connection
//!   (see [`Storage::tx_connection`])
//! - readers (dashboards) use [`Storage::open_readonly`]

mod audit;
mod backfill;
mod claims;
mod evidence;
mod graph;
mod items;
mod jobs;
mod migrations;
mod rules;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use regtruth_shared::{RegTruthError, Result};

pub use audit::{AuditEvent, Rejection, ReleaseEvent};
pub use claims::GroundedClaim;
pub use evidence::{EvidenceUpsert, NewEvidence, StaleCandidate};
pub use jobs::{DeadLetter, Job, JobState, NewJob, QueueCount};
pub use rules::{CompositionWrite, PublicationWrite, ResolutionWrite};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| RegTruthError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(RegTruthError::storage)?;

        let conn = db.connect().map_err(RegTruthError::storage)?;
        configure_connection(&conn).await?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for dashboards).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(RegTruthError::storage)?;

        let conn = db.connect().map_err(RegTruthError::storage)?;
        configure_connection(&conn).await?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        RegTruthError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(RegTruthError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// A fresh connection for a multi-statement transaction, so that
    /// concurrent workers sharing `self.conn` never interleave inside it.
    async fn tx_connection(&self) -> Result<Connection> {
        self.check_writable()?;
        let conn = self.db.connect().map_err(RegTruthError::storage)?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    /// Count rows of `table` grouped by `column`. Both names are compile-time constants.
    async fn count_grouped(&self, table: &str, column: &str) -> Result<Vec<(String, i64)>> {
        let sql = format!("SELECT {column}, COUNT(*) FROM {table} GROUP BY {column} ORDER BY {column}");
        let mut rows = self
            .conn
            .query(&sql, params![])
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push((get_string(&row, 0)?, row.get::<i64>(1).map_err(RegTruthError::storage)?));
        }
        Ok(results)
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
        BUSY_TIMEOUT.as_millis()
    ))
    .await
    .map_err(RegTruthError::storage)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp so lexical order equals chronological order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegTruthError::Storage(format!("invalid timestamp '{s}': {e}")))
}

pub(crate) fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(RegTruthError::storage)
}

pub(crate) fn get_opt_string(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&get_string(row, idx)?)
}

pub(crate) fn get_opt_ts(row: &libsql::Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    get_opt_string(row, idx).map(|s| parse_ts(&s)).transpose()
}

pub(crate) fn get_opt_date(row: &libsql::Row, idx: i32) -> Result<Option<chrono::NaiveDate>> {
    get_opt_string(row, idx)
        .map(|s| {
            chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| RegTruthError::Storage(format!("invalid date '{s}': {e}")))
        })
        .transpose()
}

pub(crate) fn get_parsed<T>(row: &libsql::Row, idx: i32) -> Result<T>
where
    T: std::str::FromStr<Err = RegTruthError>,
{
    get_string(row, idx)?.parse()
}

pub(crate) fn get_json<T: serde::de::DeserializeOwned>(row: &libsql::Row, idx: i32) -> Result<T> {
    let raw = get_string(row, idx)?;
    serde_json::from_str(&raw).map_err(|e| RegTruthError::Storage(format!("corrupt JSON column: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RegTruthError::Storage(format!("serialize: {e}")))
}

pub(crate) fn date_str(date: Option<chrono::NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("regtruth_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_storage;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("regtruth_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("regtruth_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro
            .record_event("test", "rule", "r1", "noop", None)
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(&ts(&a)).unwrap().timestamp_micros(), a.timestamp_micros());
    }
}
