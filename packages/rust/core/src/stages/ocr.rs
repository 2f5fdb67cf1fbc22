//! OCR sub-stage for scanned PDFs.

use std::sync::Arc;

use async_trait::async_trait;
use regtruth_crawler::OcrEngine;
use regtruth_shared::{ItemState, QueueName};
use regtruth_storage::{Job, Storage};
use tracing::{info, instrument};

use super::{EvidenceJob, settle_item};
use crate::context::StageContext;
use crate::queue::{JobError, JobHandler, decode, enqueue_next};

pub struct OcrStage {
    storage: Arc<Storage>,
    engine: Option<Arc<dyn OcrEngine>>,
}

impl OcrStage {
    pub fn new(storage: Arc<Storage>, engine: Option<Arc<dyn OcrEngine>>) -> Self {
        Self { storage, engine }
    }

    async fn give_up(&self, payload: &EvidenceJob, job: &Job, reason: &str) -> JobError {
        let state = ItemState::Skipped {
            reason: reason.to_string(),
        };
        match settle_item(&self.storage, payload.item_id.as_deref(), &state).await {
            Ok(()) => JobError::validation(reason, job.payload.clone()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobHandler for OcrStage {
    fn queue(&self) -> QueueName {
        QueueName::Ocr
    }

    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn handle(&self, ctx: &StageContext, job: &Job) -> Result<(), JobError> {
        let payload: EvidenceJob = decode(job)?;
        let Some(evidence) = self.storage.get_evidence(&payload.evidence_id).await? else {
            return Err(JobError::validation(
                format!("unknown evidence {}", payload.evidence_id),
                job.payload.clone(),
            ));
        };

        if evidence.ocr_text.is_none() {
            let Some(engine) = &self.engine else {
                return Err(self.give_up(&payload, job, "no OCR engine configured").await);
            };
            let text = engine
                .recognize(&evidence.raw_content)
                .await
                .map_err(|e| JobError::Transient(format!("{}: {e}", engine.name())))?;
            if text.trim().is_empty() {
                return Err(self.give_up(&payload, job, "OCR produced no text").await);
            }
            self.storage.set_ocr_text(&evidence.id, text.trim()).await?;
            info!(evidence_id = %evidence.id, engine = engine.name(), chars = text.len(), "recognized scanned document");
        }

        enqueue_next(
            &self.storage,
            ctx,
            QueueName::Extract,
            &evidence.id,
            &payload,
            job.priority,
        )
        .await?;
        Ok(())
    }
}
