//! Explicit per-cycle context passed to every stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regtruth_shared::AppConfig;
use uuid::Uuid;

/// What started a pipeline cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// One-shot `pipeline run-once`.
    RunOnce,
    /// A cycle of the continuous drain loop.
    Drain,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunOnce => "run-once",
            Self::Drain => "drain",
        }
    }
}

/// Cycle-scoped values that stages would otherwise reach for globally.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: String,
    pub trigger: Trigger,
    pub now: DateTime<Utc>,
    pub config: Arc<AppConfig>,
}

impl StageContext {
    pub fn new(config: Arc<AppConfig>, trigger: Trigger) -> Self {
        Self {
            run_id: Uuid::now_v7().to_string(),
            trigger,
            now: Utc::now(),
            config,
        }
    }

    /// Actor recorded on automated lifecycle changes.
    pub fn actor(&self, stage: &str) -> String {
        format!("{stage}:{}", self.trigger.as_str())
    }
}
