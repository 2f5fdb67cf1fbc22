//! Stage workers over the durable job queues.
//!
//! Each stage owns one [`StageWorker`]: a concurrency cap (semaphore) and a
//! token bucket (`governor`) sized from the stage's [`QueueConfig`]. A batch
//! claims ready jobs, runs the handler on each, and settles the outcome:
//!
//! - success: the job completes and is retained for deduplication
//! - [`JobError::Transient`]: retried with exponential backoff until the
//!   attempt cap, then dead-lettered
//! - [`JobError::Permanent`]: dead-lettered immediately
//! - [`JobError::Validation`]: a rejection record keeps the payload, and
//!   the job completes

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use regtruth_shared::{QueueConfig, QueueName, RegTruthError};
use regtruth_storage::{Job, NewJob, Storage};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::context::StageContext;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Longest delay between two attempts of one job.
const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Failure of one job attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    /// Malformed input; routed to a rejection record, never retried.
    #[error("rejected: {reason}")]
    Validation {
        reason: String,
        payload: serde_json::Value,
    },
}

impl JobError {
    pub fn validation(reason: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Validation {
            reason: reason.into(),
            payload,
        }
    }
}

impl From<RegTruthError> for JobError {
    /// Storage and network trouble is worth retrying; bad input is not.
    fn from(err: RegTruthError) -> Self {
        match err {
            RegTruthError::Validation { message } | RegTruthError::Parse { message } => {
                Self::Validation {
                    reason: message,
                    payload: serde_json::Value::Null,
                }
            }
            RegTruthError::NotFound(what) => Self::Permanent(format!("not found: {what}")),
            RegTruthError::InvalidTransition { .. } | RegTruthError::Config { .. } => {
                Self::Permanent(err.to_string())
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Decode a job payload; a payload that does not parse is a validation error.
pub fn decode<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone()).map_err(|e| {
        JobError::validation(format!("malformed {} payload: {e}", job.queue), job.payload.clone())
    })
}

/// One stage's job logic.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;

    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError>;
}

/// Outcome counts of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub rejected: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.retried + self.dead_lettered + self.rejected
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.rejected += other.rejected;
    }
}

enum Settled {
    Completed,
    Retried,
    DeadLettered,
    Rejected,
}

/// `base * 2^(attempt - 1)`, capped.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let ms = base_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

/// Enqueue a follow-up job with the target queue's attempt cap.
pub async fn enqueue_next<T: Serialize>(
    storage: &Storage,
    ctx: &StageContext,
    queue: QueueName,
    id: impl Into<String>,
    payload: &T,
    priority: i64,
) -> Result<bool, JobError> {
    let payload = serde_json::to_value(payload)
        .map_err(|e| JobError::Permanent(format!("serialize {queue} payload: {e}")))?;
    let job = NewJob::new(queue, id, payload)
        .priority(priority)
        .max_attempts(ctx.config.queues.for_queue(queue).attempts);
    let added = storage.enqueue(&job).await?;
    if !added {
        debug!(%queue, job_id = %job.id, "job already known, not enqueued");
    }
    Ok(added)
}

pub struct StageWorker {
    handler: Arc<dyn JobHandler>,
    storage: Arc<Storage>,
    config: QueueConfig,
    slots: Arc<Semaphore>,
    limiter: Arc<DirectRateLimiter>,
}

impl StageWorker {
    pub fn new(handler: Arc<dyn JobHandler>, storage: Arc<Storage>, config: QueueConfig) -> Self {
        let per_window = NonZeroU32::new(config.max_jobs_per_window.max(1)).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(config.window_secs.max(1));
        let quota = Quota::with_period(window / per_window.get())
            .unwrap_or_else(|| Quota::per_second(per_window))
            .allow_burst(per_window);

        Self {
            handler,
            storage,
            slots: Arc::new(Semaphore::new(config.concurrency.max(1) as usize)),
            limiter: Arc::new(RateLimiter::direct(quota)),
            config,
        }
    }

    pub fn queue(&self) -> QueueName {
        self.handler.queue()
    }

    /// Claim up to `limit` ready jobs and run them under the stage limits.
    pub async fn run_batch(
        &self,
        ctx: &StageContext,
        limit: usize,
    ) -> regtruth_shared::Result<BatchReport> {
        let queue = self.queue();
        let jobs = self.storage.claim_jobs(queue, limit, ctx.now).await?;
        if jobs.is_empty() {
            return Ok(BatchReport::default());
        }
        debug!(%queue, claimed = jobs.len(), "running batch");

        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let handler = self.handler.clone();
            let storage = self.storage.clone();
            let slots = self.slots.clone();
            let limiter = self.limiter.clone();
            let config = self.config;
            let ctx = ctx.clone();

            handles.push(tokio::spawn(async move {
                let result = match slots.acquire_owned().await {
                    Ok(_permit) => {
                        limiter.until_ready().await;
                        handler.handle(&ctx, &job).await
                    }
                    Err(_) => Err(JobError::Transient(format!("{} worker slots closed", job.queue))),
                };
                settle(&storage, &config, &job, result, Utc::now()).await
            }));
        }

        let mut report = BatchReport::default();
        for handle in handles {
            match handle.await {
                Ok(Ok(Settled::Completed)) => report.completed += 1,
                Ok(Ok(Settled::Retried)) => report.retried += 1,
                Ok(Ok(Settled::DeadLettered)) => report.dead_lettered += 1,
                Ok(Ok(Settled::Rejected)) => report.rejected += 1,
                // The job stays active; startup recovery puts it back.
                Ok(Err(e)) => error!(%queue, error = %e, "failed to settle job"),
                Err(e) => error!(%queue, error = %e, "job task panicked"),
            }
        }

        let pruned = self
            .storage
            .prune_jobs(
                queue,
                self.config.keep_completed as usize,
                self.config.keep_failed as usize,
            )
            .await?;
        if pruned > 0 {
            debug!(%queue, pruned, "pruned retained jobs");
        }

        if report.total() > 0 {
            info!(
                %queue,
                completed = report.completed,
                retried = report.retried,
                dead = report.dead_lettered,
                rejected = report.rejected,
                "batch finished"
            );
        }
        Ok(report)
    }
}

async fn settle(
    storage: &Storage,
    config: &QueueConfig,
    job: &Job,
    result: Result<(), JobError>,
    now: DateTime<Utc>,
) -> regtruth_shared::Result<Settled> {
    match result {
        Ok(()) => {
            storage.complete_job(job.queue, &job.id).await?;
            Ok(Settled::Completed)
        }
        Err(JobError::Transient(msg)) if job.attempts_left() => {
            let delay = backoff_delay(config.backoff_base_ms, job.attempts);
            let run_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
            warn!(
                queue = %job.queue,
                job_id = %job.id,
                attempt = job.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %msg,
                "job failed, will retry"
            );
            storage.retry_job(job.queue, &job.id, run_at, &msg).await?;
            Ok(Settled::Retried)
        }
        Err(JobError::Transient(msg)) | Err(JobError::Permanent(msg)) => {
            warn!(queue = %job.queue, job_id = %job.id, attempts = job.attempts, error = %msg, "job dead-lettered");
            storage.dead_letter_job(job.queue, &job.id, &msg).await?;
            Ok(Settled::DeadLettered)
        }
        Err(JobError::Validation { reason, payload }) => {
            let payload = if payload.is_null() {
                job.payload.clone()
            } else {
                payload
            };
            warn!(queue = %job.queue, job_id = %job.id, %reason, "job rejected");
            storage
                .insert_rejection(job.queue.as_str(), &job.id, &reason, &payload)
                .await?;
            storage.complete_job(job.queue, &job.id).await?;
            Ok(Settled::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Trigger;
    use crate::test_support::test_storage;
    use regtruth_shared::AppConfig;
    use regtruth_storage::JobState;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        outcome: fn(usize, &Job) -> Result<(), JobError>,
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn queue(&self) -> QueueName {
            QueueName::Extract
        }

        async fn handle(&self, _ctx: &StageContext, job: &Job) -> Result<(), JobError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(n, job)
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            concurrency: 2,
            max_jobs_per_window: 100,
            window_secs: 1,
            attempts: 2,
            backoff_base_ms: 1_000,
            keep_completed: 100,
            keep_failed: 100,
        }
    }

    fn ctx() -> StageContext {
        StageContext::new(Arc::new(AppConfig::default()), Trigger::RunOnce)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1_000, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(1_000, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(1_000, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(1_000, 40), MAX_BACKOFF);
    }

    #[test]
    fn storage_errors_are_transient_and_bad_input_is_not() {
        assert!(matches!(
            JobError::from(RegTruthError::Storage("locked".into())),
            JobError::Transient(_)
        ));
        assert!(matches!(
            JobError::from(RegTruthError::validation("empty quote")),
            JobError::Validation { .. }
        ));
        assert!(matches!(
            JobError::from(RegTruthError::NotFound("rule x".into())),
            JobError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_dead_letter() {
        let storage = Arc::new(test_storage().await);
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            outcome: |_, _| Err(JobError::Transient("HTTP 503".into())),
        });
        let worker = StageWorker::new(handler, storage.clone(), config());
        storage
            .enqueue(&NewJob::new(QueueName::Extract, "ev-1", json!({})).max_attempts(2))
            .await
            .unwrap();

        let mut ctx = ctx();
        let first = worker.run_batch(&ctx, 10).await.unwrap();
        assert_eq!(first.retried, 1);
        let job = storage.get_job(QueueName::Extract, "ev-1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert!(job.run_at > ctx.now);

        // Not ready until the backoff has elapsed.
        assert_eq!(worker.run_batch(&ctx, 10).await.unwrap().total(), 0);

        ctx.now = job.run_at + chrono::Duration::seconds(1);
        let second = worker.run_batch(&ctx, 10).await.unwrap();
        assert_eq!(second.dead_lettered, 1);

        let dead = storage.list_dead_letters(Some(QueueName::Extract), 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("503"));
    }

    #[tokio::test]
    async fn validation_errors_become_rejections() {
        let storage = Arc::new(test_storage().await);
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            outcome: |_, _| {
                Err(JobError::validation(
                    "quote not found in evidence",
                    json!({"quote": "Stopa je 25%."}),
                ))
            },
        });
        let worker = StageWorker::new(handler, storage.clone(), config());
        storage
            .enqueue(&NewJob::new(QueueName::Extract, "ev-2", json!({"evidence_id": "ev-2"})))
            .await
            .unwrap();

        let report = worker.run_batch(&ctx(), 10).await.unwrap();
        assert_eq!(report.rejected, 1);

        let rejections = storage.list_rejections(10).await.unwrap();
        assert_eq!(rejections[0].stage, "extract");
        assert_eq!(rejections[0].payload["quote"], "Stopa je 25%.");
        let job = storage.get_job(QueueName::Extract, "ev-2").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn completed_ids_are_not_enqueued_again() {
        let storage = Arc::new(test_storage().await);
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            outcome: |_, _| Ok(()),
        });
        let worker = StageWorker::new(handler.clone(), storage.clone(), config());
        let job = NewJob::new(QueueName::Extract, "ev-3", json!({}));
        assert!(storage.enqueue(&job).await.unwrap());
        assert_eq!(worker.run_batch(&ctx(), 10).await.unwrap().completed, 1);

        assert!(!storage.enqueue(&job).await.unwrap());
        assert_eq!(worker.run_batch(&ctx(), 10).await.unwrap().total(), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_worker_slots_retry_the_job_unrun() {
        let storage = Arc::new(test_storage().await);
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            outcome: |_, _| Ok(()),
        });
        let worker = StageWorker::new(handler.clone(), storage.clone(), config());
        storage
            .enqueue(&NewJob::new(QueueName::Extract, "ev-4", json!({})))
            .await
            .unwrap();
        worker.slots.close();

        let report = worker.run_batch(&ctx(), 10).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let job = storage.get_job(QueueName::Extract, "ev-4").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert!(job.last_error.unwrap().contains("slots closed"));
    }
}
