//! Durable job queues.
//!
//! A job is keyed by `(queue, id)`. Enqueue is insert-if-absent, so a job ID
//! that is waiting, active, retained as completed or dead-lettered is never
//! enqueued twice. Claiming flips `waiting -> active` with a guarded update;
//! only the worker whose update touched the row runs the job.

use chrono::{DateTime, Utc};
use libsql::params;
use regtruth_shared::{QueueName, RegTruthError, Result};
use serde::{Deserialize, Serialize};

use crate::{Storage, get_json, get_opt_string, get_parsed, get_string, get_ts, to_json, ts};

const JOB_COLUMNS: &str = "queue, id, payload_json, state, priority, attempts, max_attempts, \
     run_at, last_error, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = RegTruthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            other => Err(RegTruthError::parse(format!("unknown job state '{other}'"))),
        }
    }
}

/// A job about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: QueueName,
    pub id: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn new(queue: QueueName, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue,
            id: id.into(),
            payload,
            priority: 0,
            max_attempts: 3,
            run_at: Utc::now(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// A claimed or listed job.
#[derive(Debug, Clone)]
pub struct Job {
    pub queue: QueueName,
    pub id: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i64,
    /// Attempts started so far, including the current one once claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: QueueName,
    pub id: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCount {
    pub queue: String,
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub dead: i64,
}

impl Storage {
    /// Enqueue unless `(queue, id)` already exists. Returns `true` if added.
    pub async fn enqueue(&self, job: &NewJob) -> Result<bool> {
        self.check_writable()?;
        let now = ts(&Utc::now());
        let affected = self
            .conn
            .execute(
                "INSERT INTO jobs (queue, id, payload_json, state, priority, attempts, max_attempts,
                    run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'waiting', ?4, 0, ?5, ?6, ?7, ?7)
                 ON CONFLICT(queue, id) DO NOTHING",
                params![
                    job.queue.as_str(),
                    job.id.as_str(),
                    to_json(&job.payload)?,
                    job.priority,
                    i64::from(job.max_attempts),
                    ts(&job.run_at),
                    now.as_str(),
                ],
            )
            .await
            .map_err(RegTruthError::storage)?;

        if affected == 1 {
            tracing::debug!(queue = %job.queue, job_id = %job.id, "job enqueued");
        }
        Ok(affected == 1)
    }

    pub async fn job_exists(&self, queue: QueueName, id: &str) -> Result<bool> {
        Ok(self.get_job(queue, id).await?.is_some())
    }

    pub async fn get_job(&self, queue: QueueName, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 AND id = ?2");
        let mut rows = self
            .conn
            .query(&sql, params![queue.as_str(), id])
            .await
            .map_err(RegTruthError::storage)?;
        match rows.next().await.map_err(RegTruthError::storage)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    /// Claim up to `limit` due jobs, highest priority first.
    pub async fn claim_jobs(
        &self,
        queue: QueueName,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        self.check_writable()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE queue = ?1 AND state = 'waiting' AND run_at <= ?2
             ORDER BY priority DESC, run_at, created_at
             LIMIT ?3"
        );
        let mut rows = self
            .conn
            .query(&sql, params![queue.as_str(), ts(&now), limit as i64])
            .await
            .map_err(RegTruthError::storage)?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            candidates.push(row_to_job(&row)?);
        }
        drop(rows);

        let stamp = ts(&Utc::now());
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            let affected = self
                .conn
                .execute(
                    "UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?1
                     WHERE queue = ?2 AND id = ?3 AND state = 'waiting'",
                    params![stamp.as_str(), queue.as_str(), job.id.as_str()],
                )
                .await
                .map_err(RegTruthError::storage)?;
            if affected == 1 {
                job.state = JobState::Active;
                job.attempts += 1;
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    pub async fn complete_job(&self, queue: QueueName, id: &str) -> Result<()> {
        self.check_writable()?;
        let now = ts(&Utc::now());
        self.conn
            .execute(
                "UPDATE jobs SET state = 'completed', last_error = NULL, updated_at = ?1, finished_at = ?1
                 WHERE queue = ?2 AND id = ?3",
                params![now.as_str(), queue.as_str(), id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }

    /// Put an active job back to `waiting`, due at `run_at`.
    pub async fn retry_job(
        &self,
        queue: QueueName,
        id: &str,
        run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE jobs SET state = 'waiting', run_at = ?1, last_error = ?2, updated_at = ?3
                 WHERE queue = ?4 AND id = ?5",
                params![ts(&run_at), error, ts(&Utc::now()), queue.as_str(), id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        Ok(())
    }

    /// Move a job to the dead-letter store. The job row is kept in state
    /// `dead` so the same ID cannot be enqueued again until it is retried.
    pub async fn dead_letter_job(&self, queue: QueueName, id: &str, error: &str) -> Result<()> {
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(RegTruthError::storage)?;
        let now = ts(&Utc::now());

        tx.execute(
            "INSERT INTO dead_letters (queue, id, payload_json, attempts, error, failed_at)
             SELECT queue, id, payload_json, attempts, ?1, ?2 FROM jobs WHERE queue = ?3 AND id = ?4
             ON CONFLICT(queue, id) DO UPDATE SET
                attempts = excluded.attempts,
                error = excluded.error,
                failed_at = excluded.failed_at",
            params![error, now.as_str(), queue.as_str(), id],
        )
        .await
        .map_err(RegTruthError::storage)?;

        tx.execute(
            "UPDATE jobs SET state = 'dead', last_error = ?1, updated_at = ?2, finished_at = ?2
             WHERE queue = ?3 AND id = ?4",
            params![error, now.as_str(), queue.as_str(), id],
        )
        .await
        .map_err(RegTruthError::storage)?;

        tx.commit().await.map_err(RegTruthError::storage)?;
        tracing::warn!(queue = %queue, job_id = id, error, "job dead-lettered");
        Ok(())
    }

    /// Operator retry of a dead-lettered job. Returns `false` if not dead.
    pub async fn requeue_dead(&self, queue: QueueName, id: &str) -> Result<bool> {
        let conn = self.tx_connection().await?;
        let tx = conn.transaction().await.map_err(RegTruthError::storage)?;
        let now = ts(&Utc::now());

        let affected = tx
            .execute(
                "UPDATE jobs SET state = 'waiting', attempts = 0, run_at = ?1, updated_at = ?1,
                    finished_at = NULL
                 WHERE queue = ?2 AND id = ?3 AND state = 'dead'",
                params![now.as_str(), queue.as_str(), id],
            )
            .await
            .map_err(RegTruthError::storage)?;
        tx.execute(
            "DELETE FROM dead_letters WHERE queue = ?1 AND id = ?2",
            params![queue.as_str(), id],
        )
        .await
        .map_err(RegTruthError::storage)?;

        tx.commit().await.map_err(RegTruthError::storage)?;
        Ok(affected == 1)
    }

    pub async fn list_dead_letters(
        &self,
        queue: Option<QueueName>,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        let mut rows = match queue {
            Some(q) => self
                .conn
                .query(
                    "SELECT queue, id, payload_json, attempts, error, failed_at FROM dead_letters
                     WHERE queue = ?1 ORDER BY failed_at DESC LIMIT ?2",
                    params![q.as_str(), limit as i64],
                )
                .await,
            None => self
                .conn
                .query(
                    "SELECT queue, id, payload_json, attempts, error, failed_at FROM dead_letters
                     ORDER BY failed_at DESC LIMIT ?1",
                    params![limit as i64],
                )
                .await,
        }
        .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(DeadLetter {
                queue: get_parsed(&row, 0)?,
                id: get_string(&row, 1)?,
                payload: get_json(&row, 2)?,
                attempts: row.get::<i64>(3).map_err(RegTruthError::storage)? as u32,
                error: get_string(&row, 4)?,
                failed_at: get_ts(&row, 5)?,
            });
        }
        Ok(results)
    }

    /// Jobs of one queue in one state, oldest first.
    pub async fn list_jobs(&self, queue: QueueName, state: JobState, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue = ?1 AND state = ?2
             ORDER BY created_at LIMIT ?3"
        );
        let mut rows = self
            .conn
            .query(&sql, params![queue.as_str(), state.as_str(), limit as i64])
            .await
            .map_err(RegTruthError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            results.push(row_to_job(&row)?);
        }
        Ok(results)
    }

    /// Drop finished jobs beyond the retention limits, newest kept.
    /// Returns the number of job rows removed.
    pub async fn prune_jobs(
        &self,
        queue: QueueName,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<u64> {
        self.check_writable()?;
        let completed = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE queue = ?1 AND state = 'completed' AND id NOT IN (
                    SELECT id FROM jobs WHERE queue = ?1 AND state = 'completed'
                    ORDER BY finished_at DESC LIMIT ?2)",
                params![queue.as_str(), keep_completed as i64],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let dead = self
            .conn
            .execute(
                "DELETE FROM jobs WHERE queue = ?1 AND state = 'dead' AND id NOT IN (
                    SELECT id FROM jobs WHERE queue = ?1 AND state = 'dead'
                    ORDER BY finished_at DESC LIMIT ?2)",
                params![queue.as_str(), keep_failed as i64],
            )
            .await
            .map_err(RegTruthError::storage)?;

        self.conn
            .execute(
                "DELETE FROM dead_letters WHERE queue = ?1 AND id NOT IN (
                    SELECT id FROM jobs WHERE queue = ?1 AND state = 'dead')",
                params![queue.as_str()],
            )
            .await
            .map_err(RegTruthError::storage)?;

        Ok(completed + dead)
    }

    /// Return jobs claimed before `claimed_before` and still `active` to
    /// `waiting`. Younger claims may belong to a live worker and are kept.
    pub async fn reset_stale_active(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE jobs SET state = 'waiting', updated_at = ?1
                 WHERE state = 'active' AND updated_at < ?2",
                params![ts(&Utc::now()), ts(&claimed_before)],
            )
            .await
            .map_err(RegTruthError::storage)?;
        if affected > 0 {
            tracing::warn!(count = affected, "reset jobs whose lease expired");
        }
        Ok(affected)
    }

    /// Waiting jobs due at `now` across the given queues.
    pub async fn ready_count(&self, queues: &[QueueName], now: DateTime<Utc>) -> Result<i64> {
        let mut total = 0;
        for queue in queues {
            let mut rows = self
                .conn
                .query(
                    "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND state = 'waiting' AND run_at <= ?2",
                    params![queue.as_str(), ts(&now)],
                )
                .await
                .map_err(RegTruthError::storage)?;
            if let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
                total += row.get::<i64>(0).map_err(RegTruthError::storage)?;
            }
        }
        Ok(total)
    }

    /// Earliest `run_at` among waiting jobs of the given queues.
    pub async fn next_due_at(&self, queues: &[QueueName]) -> Result<Option<DateTime<Utc>>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for queue in queues {
            let mut rows = self
                .conn
                .query(
                    "SELECT MIN(run_at) FROM jobs WHERE queue = ?1 AND state = 'waiting'",
                    params![queue.as_str()],
                )
                .await
                .map_err(RegTruthError::storage)?;
            if let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
                if let Some(raw) = get_opt_string(&row, 0) {
                    let at = crate::parse_ts(&raw)?;
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
            }
        }
        Ok(earliest)
    }

    /// Job counts per queue and state.
    pub async fn queue_counts(&self) -> Result<Vec<QueueCount>> {
        let mut rows = self
            .conn
            .query(
                "SELECT queue, state, COUNT(*) FROM jobs GROUP BY queue, state ORDER BY queue",
                params![],
            )
            .await
            .map_err(RegTruthError::storage)?;

        let mut results: Vec<QueueCount> = Vec::new();
        while let Some(row) = rows.next().await.map_err(RegTruthError::storage)? {
            let queue = get_string(&row, 0)?;
            let state: JobState = get_parsed(&row, 1)?;
            let count = row.get::<i64>(2).map_err(RegTruthError::storage)?;

            if results.last().is_none_or(|c| c.queue != queue) {
                results.push(QueueCount {
                    queue,
                    ..Default::default()
                });
            }
            if let Some(entry) = results.last_mut() {
                match state {
                    JobState::Waiting => entry.waiting = count,
                    JobState::Active => entry.active = count,
                    JobState::Completed => entry.completed = count,
                    JobState::Dead => entry.dead = count,
                }
            }
        }
        Ok(results)
    }
}

fn row_to_job(row: &libsql::Row) -> Result<Job> {
    Ok(Job {
        queue: get_parsed(row, 0)?,
        id: get_string(row, 1)?,
        payload: get_json(row, 2)?,
        state: get_parsed(row, 3)?,
        priority: row.get::<i64>(4).map_err(RegTruthError::storage)?,
        attempts: row.get::<i64>(5).map_err(RegTruthError::storage)? as u32,
        max_attempts: row.get::<i64>(6).map_err(RegTruthError::storage)? as u32,
        run_at: get_ts(row, 7)?,
        last_error: get_opt_string(row, 8),
        created_at: get_ts(row, 9)?,
    })
}
