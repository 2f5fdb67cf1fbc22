//! Fetch and classify: discovered item -> immutable evidence.

use std::sync::Arc;

use async_trait::async_trait;
use regtruth_crawler::{FetchError, Fetcher, classify};
use regtruth_shared::{ContentClass, DiscoveredItem, ItemState, QueueName};
use regtruth_storage::{EvidenceUpsert, Job, NewEvidence, Storage};
use serde_json::json;
use tracing::{debug, info, instrument};

use super::{EvidenceJob, FetchJob};
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode, enqueue_next};

pub struct FetchStage {
    storage: Arc<Storage>,
    fetcher: Arc<Fetcher>,
}

impl FetchStage {
    pub fn new(storage: Arc<Storage>, fetcher: Arc<Fetcher>) -> Self {
        Self { storage, fetcher }
    }

    /// Item bookkeeping for a failed fetch, returning the job outcome.
    async fn fail(
        &self,
        ctx: &StageContext,
        job: &Job,
        item: &DiscoveredItem,
        err: FetchError,
    ) -> Result<(), JobError> {
        let retries_left = item.retry_count < ctx.config.fetch.max_item_retries;
        match err {
            FetchError::Transient(msg) if retries_left && job.attempts_left() => {
                self.storage
                    .set_item_state(&item.id, &ItemState::Pending, None, item.retry_count + 1)
                    .await?;
                Err(JobError::Transient(msg))
            }
            FetchError::Transient(msg) => {
                let state = ItemState::Failed {
                    error: msg.clone(),
                    permanent: false,
                };
                self.storage
                    .set_item_state(&item.id, &state, None, item.retry_count)
                    .await?;
                Err(JobError::Permanent(format!("retries exhausted: {msg}")))
            }
            FetchError::Permanent(msg) => {
                let state = ItemState::Failed {
                    error: msg.clone(),
                    permanent: true,
                };
                self.storage
                    .set_item_state(&item.id, &state, None, item.retry_count)
                    .await?;
                Err(JobError::Permanent(msg))
            }
        }
    }

    /// Send evidence to OCR or extraction, depending on its class.
    async fn route(
        &self,
        ctx: &StageContext,
        job: &Job,
        class: ContentClass,
        next: &EvidenceJob,
    ) -> Result<bool, JobError> {
        let queue = match class {
            ContentClass::ScannedPdf => QueueName::Ocr,
            ContentClass::Html | ContentClass::TextPdf => QueueName::Extract,
            ContentClass::Other => return Ok(false),
        };
        enqueue_next(&self.storage, ctx, queue, &next.evidence_id, next, job.priority).await?;
        Ok(true)
    }
}

#[async_trait]
impl JobHandler for FetchStage {
    fn queue(&self) -> QueueName {
        QueueName::Fetch
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError> {
        let payload: FetchJob = decode(job)?;
        let Some(item) = self.storage.get_item(&payload.item_id).await? else {
            return Err(JobError::validation(
                format!("unknown item {}", payload.item_id),
                job.payload.clone(),
            ));
        };
        if item.state.is_terminal() && !payload.reverify {
            debug!(item_id = %item.id, status = %item.status(), "item already settled");
            return Ok(());
        }

        let doc = match self.fetcher.fetch(&item.url).await {
            Ok(doc) => doc,
            Err(err) => return self.fail(ctx, job, &item, err).await,
        };

        let class = classify(
            doc.content_type.as_deref(),
            &doc.body,
            ctx.config.fetch.pdf_text_density,
        );
        let EvidenceUpsert { id: evidence_id, created } = self
            .storage
            .upsert_evidence(&NewEvidence {
                source_id: item.source_id.clone(),
                url: item.url.clone(),
                content_hash: doc.content_hash.clone(),
                raw_content: doc.body,
                content_type: doc.content_type.clone(),
                content_class: class,
                fetched_at: doc.fetched_at,
            })
            .await?;
        let next = EvidenceJob {
            evidence_id: evidence_id.clone(),
            item_id: Some(item.id.clone()),
        };

        if payload.reverify {
            if !created {
                debug!(url = %item.url, %evidence_id, "content unchanged, re-verified");
                return Ok(());
            }
            info!(url = %item.url, %evidence_id, "content changed since last capture");
            self.storage
                .record_event(
                    "fetch",
                    "evidence",
                    &evidence_id,
                    "content-changed",
                    Some(json!({
                        "item_id": item.id,
                        "previous_evidence_id": item.evidence_id,
                        "content_hash": doc.content_hash,
                    })),
                )
                .await?;
            self.storage
                .relink_item_evidence(&item.id, &evidence_id, &doc.content_hash)
                .await?;
            self.route(ctx, job, class, &next).await?;
            return Ok(());
        }

        if self.route(ctx, job, class, &next).await? {
            self.storage
                .set_item_state(
                    &item.id,
                    &ItemState::Fetched {
                        evidence_id: evidence_id.clone(),
                    },
                    Some(&doc.content_hash),
                    item.retry_count,
                )
                .await?;
            info!(url = %item.url, class = %class, %evidence_id, created, "captured evidence");
        } else {
            let state = ItemState::Skipped {
                reason: format!(
                    "unsupported content type {}",
                    doc.content_type.as_deref().unwrap_or("(none)")
                ),
            };
            self.storage
                .set_item_state(&item.id, &state, Some(&doc.content_hash), item.retry_count)
                .await?;
            info!(url = %item.url, "skipped unsupported content");
        }
        Ok(())
    }
}
