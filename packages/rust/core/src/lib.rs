//! Stage workers and orchestration for the regulatory-truth pipeline.
//!
//! Each stage consumes one durable queue and produces jobs for the next:
//! fetch -> ocr -> extract -> compose -> review -> arbitrate -> release.
//! [`pipeline::Orchestrator`] runs one batch per stage per cycle, either
//! once (`run_once`) or continuously (`drain`).

pub mod context;
pub mod health;
pub mod pipeline;
pub mod queue;
pub mod stages;

pub use context::{StageContext, Trigger};
pub use health::{HealthSnapshot, SweepReport, staleness_sweep};
pub use pipeline::{CycleReport, DrainProgress, DrainSummary, Orchestrator, SilentProgress};
pub use queue::{BatchReport, JobError, JobHandler, StageWorker};
pub use stages::arbitrate::{Verdict, arbitrate};
pub use stages::compose::compose;
pub use stages::extract::{CandidateClaim, ClaimExtractor, PatternExtractor};
pub use stages::review::{ReviewDecision, decide, human_decision};
