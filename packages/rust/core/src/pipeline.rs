//! Orchestration: one worker per stage, the run-once cycle and the drain loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regtruth_crawler::{CommandOcr, DomainRateLimiter, Fetcher, OcrEngine};
use regtruth_discovery::{ScheduledDiscovery, SourcePass};
use regtruth_shared::{AppConfig, ItemStatus, QueueName, Result, job_id_for_canonical};
use regtruth_storage::{NewJob, Storage};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::context::{StageContext, Trigger};
use crate::health::{SweepReport, staleness_sweep};
use crate::queue::{BatchReport, JobHandler, StageWorker};
use crate::stages::FetchJob;
use crate::stages::arbitrate::ArbitrateStage;
use crate::stages::compose::ComposeStage;
use crate::stages::extract::{ClaimExtractor, ExtractStage, PatternExtractor};
use crate::stages::fetch::FetchStage;
use crate::stages::ocr::OcrStage;
use crate::stages::release::ReleaseStage;
use crate::stages::review::ReviewStage;

/// What one cycle did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    /// PENDING items handed to the fetch queue.
    pub promoted: usize,
    pub sweep: SweepReport,
    pub stages: BTreeMap<String, BatchReport>,
    /// Stage-local failures; they never stop the cycle.
    pub errors: Vec<String>,
}

impl CycleReport {
    /// Jobs settled across all stages.
    pub fn processed(&self) -> usize {
        self.stages.values().map(BatchReport::total).sum()
    }

    fn idle(&self) -> bool {
        self.processed() == 0 && self.promoted == 0 && self.sweep.reverify_enqueued == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainSummary {
    pub cycles: usize,
    pub processed: usize,
    pub discovered: usize,
}

/// Progress callback for the drain loop.
pub trait DrainProgress: Send + Sync {
    /// Called after every cycle.
    fn cycle(&self, number: usize, report: &CycleReport);
    /// Called before sleeping between cycles.
    fn idle(&self, sleep: Duration);
    /// Called when the loop stops.
    fn done(&self, summary: &DrainSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl DrainProgress for SilentProgress {
    fn cycle(&self, _number: usize, _report: &CycleReport) {}
    fn idle(&self, _sleep: Duration) {}
    fn done(&self, _summary: &DrainSummary) {}
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    config: Arc<AppConfig>,
    fetcher: Arc<Fetcher>,
    workers: Vec<StageWorker>,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        config: Arc<AppConfig>,
        fetcher: Arc<Fetcher>,
        ocr: Option<Arc<dyn OcrEngine>>,
        extractor: Arc<dyn ClaimExtractor>,
    ) -> Self {
        let handlers: Vec<Arc<dyn JobHandler>> = vec![
            Arc::new(FetchStage::new(storage.clone(), fetcher.clone())),
            Arc::new(OcrStage::new(storage.clone(), ocr)),
            Arc::new(ExtractStage::new(storage.clone(), extractor)),
            Arc::new(ComposeStage::new(storage.clone())),
            Arc::new(ReviewStage::new(storage.clone())),
            Arc::new(ArbitrateStage::new(storage.clone())),
            Arc::new(ReleaseStage::new(storage.clone())),
        ];
        let workers = handlers
            .into_iter()
            .filter_map(|handler| {
                let queue_config = config.queues.for_queue(handler.queue());
                if queue_config.concurrency == 0 {
                    warn!(queue = %handler.queue(), "concurrency 0, stage disabled");
                    return None;
                }
                Some(StageWorker::new(handler, storage.clone(), queue_config))
            })
            .collect();

        Self {
            storage,
            config,
            fetcher,
            workers,
        }
    }

    /// Wire the production fetcher, OCR command and pattern extractor.
    pub fn from_config(storage: Arc<Storage>, config: Arc<AppConfig>) -> Result<Self> {
        let limiter = Arc::new(DomainRateLimiter::new(config.rate_limits.clone()));
        let fetcher = Arc::new(Fetcher::new(&config.fetch, limiter)?);
        let ocr = CommandOcr::from_config(&config.ocr).map(|o| Arc::new(o) as Arc<dyn OcrEngine>);
        if ocr.is_none() {
            info!("no OCR command configured; scanned PDFs will be skipped");
        }
        let extractor = Arc::new(PatternExtractor::from_config(&config.extraction)?);
        Ok(Self::new(storage, config, fetcher, ocr, extractor))
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// Put jobs whose claim outlived the lease back in line. Claims younger
    /// than the lease may belong to another live process and are left alone.
    pub async fn recover(&self) -> Result<u64> {
        let lease = Duration::from_secs(self.config.drain.lease_secs);
        let claimed_before = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease));
        let Some(claimed_before) = claimed_before else {
            return Ok(0);
        };
        self.storage.reset_stale_active(claimed_before).await
    }

    /// Scheduled discovery over the due sources.
    pub async fn discover(&self, force: bool) -> Result<Vec<SourcePass>> {
        ScheduledDiscovery::new(&self.storage, &self.fetcher, &self.config)
            .run(Utc::now(), force)
            .await
    }

    /// Hand PENDING items to the fetch queue. Items whose fetch job is
    /// already known are not enqueued twice.
    pub async fn promote_pending(&self, ctx: &StageContext) -> Result<usize> {
        let items = self
            .storage
            .list_items_by_status(ItemStatus::Pending, ctx.config.drain.batch_size)
            .await?;
        let attempts = ctx.config.queues.for_queue(QueueName::Fetch).attempts;

        let mut promoted = 0;
        for item in items {
            let priority = ctx
                .config
                .source(&item.source_id)
                .map(|s| s.tier.queue_priority())
                .unwrap_or_default();
            let payload = FetchJob {
                item_id: item.id.clone(),
                source_id: item.source_id.clone(),
                url: item.url.clone(),
                reverify: false,
            };
            let job = NewJob::new(
                QueueName::Fetch,
                job_id_for_canonical(&item.source_id, &item.canonical_url),
                serde_json::to_value(&payload)
                    .map_err(|e| regtruth_shared::RegTruthError::validation(e.to_string()))?,
            )
            .priority(priority)
            .max_attempts(attempts);
            if self.storage.enqueue(&job).await? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// One batch of a single stage.
    pub async fn run_stage(&self, ctx: &StageContext, queue: QueueName) -> Result<BatchReport> {
        match self.workers.iter().find(|w| w.queue() == queue) {
            Some(worker) => worker.run_batch(ctx, ctx.config.drain.batch_size).await,
            None => Ok(BatchReport::default()),
        }
    }

    /// Promote, sweep, then one batch per stage in pipeline order.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, trigger = ctx.trigger.as_str()))]
    pub async fn run_once(&self, ctx: &StageContext) -> Result<CycleReport> {
        let mut report = CycleReport {
            run_id: ctx.run_id.clone(),
            ..CycleReport::default()
        };

        match self.promote_pending(ctx).await {
            Ok(n) => report.promoted = n,
            Err(e) => report.errors.push(format!("promote: {e}")),
        }
        match staleness_sweep(&self.storage, &ctx.config, ctx.now).await {
            Ok(sweep) => report.sweep = sweep,
            Err(e) => report.errors.push(format!("staleness: {e}")),
        }

        for worker in &self.workers {
            let queue = worker.queue();
            // Each stage sees the jobs the previous one just produced.
            let stage_ctx = StageContext {
                now: Utc::now(),
                ..ctx.clone()
            };
            match worker.run_batch(&stage_ctx, ctx.config.drain.batch_size).await {
                Ok(batch) => {
                    report.stages.insert(queue.as_str().to_string(), batch);
                }
                Err(e) => {
                    warn!(%queue, error = %e, "stage batch failed");
                    report.errors.push(format!("{queue}: {e}"));
                }
            }
        }

        debug!(processed = report.processed(), promoted = report.promoted, "cycle finished");
        Ok(report)
    }

    /// Run cycles until `shutdown` resolves or `max_cycles` is reached.
    ///
    /// Sleeps `min_sleep_ms` while there is backlog and doubles the sleep up
    /// to `max_sleep_ms` while idle, never past the next scheduled retry.
    /// Shutdown is observed between cycles; an in-flight cycle finishes.
    pub async fn drain(
        &self,
        progress: &dyn DrainProgress,
        max_cycles: Option<usize>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<DrainSummary> {
        let mut shutdown = std::pin::pin!(shutdown);
        self.recover().await?;

        let min_sleep = Duration::from_millis(self.config.drain.min_sleep_ms);
        let max_sleep = Duration::from_millis(self.config.drain.max_sleep_ms.max(self.config.drain.min_sleep_ms));
        let mut idle_sleep = min_sleep;
        let mut summary = DrainSummary::default();

        loop {
            let ctx = StageContext::new(self.config.clone(), Trigger::Drain);
            match self.discover(false).await {
                Ok(passes) => summary.discovered += passes.iter().map(|p| p.queued).sum::<usize>(),
                Err(e) => warn!(error = %e, "scheduled discovery failed"),
            }
            let report = self.run_once(&ctx).await?;
            summary.cycles += 1;
            summary.processed += report.processed();
            progress.cycle(summary.cycles, &report);

            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }

            let backlog = !report.idle()
                || self.storage.ready_count(&QueueName::WORKER_QUEUES, Utc::now()).await? > 0;
            let mut sleep = if backlog {
                idle_sleep = min_sleep;
                min_sleep
            } else {
                let current = idle_sleep;
                idle_sleep = (idle_sleep * 2).min(max_sleep);
                current
            };
            if let Some(due) = self.storage.next_due_at(&QueueName::WORKER_QUEUES).await? {
                let until_due = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep = sleep.min(until_due.max(min_sleep));
            }

            progress.idle(sleep);
            tokio::select! {
                _ = &mut shutdown => {
                    info!(cycles = summary.cycles, "drain stopping");
                    break;
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        progress.done(&summary);
        Ok(summary)
    }
}
