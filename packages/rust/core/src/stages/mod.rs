//! One handler per pipeline stage, plus the job payloads they exchange.
//!
//! | queue | job id | payload |
//! |---|---|---|
//! | `fetch` | `source:hash(canonical url)` | [`FetchJob`] |
//! | `ocr` | evidence id | [`EvidenceJob`] |
//! | `extract` | evidence id | [`EvidenceJob`] |
//! | `compose` | `concept@evidence id` | [`ComposeJob`] |
//! | `review` | rule id | [`RuleJob`] |
//! | `arbitrate` | conflict id | [`ConflictJob`] |
//! | `release` | rule id, or `rule id@conflict id` after arbitration | [`RuleJob`] |

pub mod arbitrate;
pub mod compose;
pub mod extract;
pub mod fetch;
pub mod ocr;
pub mod release;
pub mod review;

pub use regtruth_discovery::FetchJob;
use regtruth_shared::ItemState;
use regtruth_storage::Storage;
use serde::{Deserialize, Serialize};

use crate::queue::JobError;

/// Payload of `ocr` and `extract` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceJob {
    pub evidence_id: String,
    /// Item to mark processed; absent for evidence without a pending item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeJob {
    pub concept: String,
}

/// Payload of `review`, `human-review` and `release` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleJob {
    pub rule_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictJob {
    pub conflict_id: String,
}

/// Move the item behind a job to `state`, keeping its retry count.
pub(crate) async fn settle_item(
    storage: &Storage,
    item_id: Option<&str>,
    state: &ItemState,
) -> Result<(), JobError> {
    let Some(item_id) = item_id else {
        return Ok(());
    };
    if let Some(item) = storage.get_item(item_id).await? {
        storage
            .set_item_state(item_id, state, None, item.retry_count)
            .await?;
    }
    Ok(())
}
