//! Core domain types for the regulatory-truth pipeline.
//!
//! Entities mirror the database rows; lifecycle enums carry their own
//! transition rules so stages cannot move a record backwards.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RegTruthError, Result};

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// database representation is a fixed string per variant.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form used in the database and CLI.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = RegTruthError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(RegTruthError::parse(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Sources & discovery
// ---------------------------------------------------------------------------

/// How a discovered item entered the shared discovery surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMethod {
    Scheduled,
    Backfill,
}

str_enum!(DiscoveryMethod { Scheduled => "SCHEDULED", Backfill => "BACKFILL" });

/// Scheduling weight of a source. Higher tiers are read more often and
/// their fetch jobs are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
    Critical,
}

str_enum!(PriorityTier {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl PriorityTier {
    /// How often a scheduled crawl re-reads the source listing.
    pub fn cadence(&self) -> chrono::Duration {
        match self {
            Self::Critical => chrono::Duration::hours(1),
            Self::High => chrono::Duration::hours(6),
            Self::Medium => chrono::Duration::hours(24),
            Self::Low => chrono::Duration::days(7),
        }
    }

    /// Queue priority (higher is claimed first).
    pub fn queue_priority(&self) -> i64 {
        match self {
            Self::Critical => 100,
            Self::High => 50,
            Self::Medium => 10,
            Self::Low => 0,
        }
    }
}

/// Legal weight of a source. Ordering follows precedence:
/// primary legislation outranks secondary guidance outranks procedural notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityLevel {
    ProceduralNotice,
    SecondaryGuidance,
    PrimaryLegislation,
}

str_enum!(AuthorityLevel {
    ProceduralNotice => "procedural_notice",
    SecondaryGuidance => "secondary_guidance",
    PrimaryLegislation => "primary_legislation",
});

impl AuthorityLevel {
    /// Numeric rank for SQL ordering (higher wins).
    pub fn rank(&self) -> i64 {
        match self {
            Self::PrimaryLegislation => 3,
            Self::SecondaryGuidance => 2,
            Self::ProceduralNotice => 1,
        }
    }
}

/// Change-frequency estimate, using the sitemap `<changefreq>` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFrequency {
    Always,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Never,
    Unknown,
}

str_enum!(ChangeFrequency {
    Always => "always",
    Hourly => "hourly",
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
    Yearly => "yearly",
    Never => "never",
    Unknown => "unknown",
});

impl ChangeFrequency {
    /// Lenient parse for listing values; anything unrecognised is `Unknown`.
    pub fn from_listing(value: &str) -> Self {
        value.trim().to_ascii_lowercase().parse().unwrap_or(Self::Unknown)
    }

    /// Freshness risk implied by how often the document changes.
    pub fn freshness_risk(&self) -> FreshnessRisk {
        match self {
            Self::Always | Self::Hourly | Self::Daily => FreshnessRisk::High,
            Self::Weekly | Self::Monthly | Self::Unknown => FreshnessRisk::Medium,
            Self::Yearly | Self::Never => FreshnessRisk::Low,
        }
    }
}

/// How likely a captured document is to go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessRisk {
    High,
    Medium,
    Low,
}

str_enum!(FreshnessRisk { High => "high", Medium => "medium", Low => "low" });

/// Flat status of a discovered item, used for indexing and counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Fetched,
    Processed,
    Skipped,
    Failed,
}

str_enum!(ItemStatus {
    Pending => "PENDING",
    Fetched => "FETCHED",
    Processed => "PROCESSED",
    Skipped => "SKIPPED",
    Failed => "FAILED",
});

/// Pipeline state of a discovered item. The flat [`ItemStatus`] is derived
/// from it; the payload lives in a JSON column so new states need no schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Fetched { evidence_id: String },
    Processed { evidence_id: String },
    Skipped { reason: String },
    Failed { error: String, permanent: bool },
}

impl ItemState {
    pub fn status(&self) -> ItemStatus {
        match self {
            Self::Pending => ItemStatus::Pending,
            Self::Fetched { .. } => ItemStatus::Fetched,
            Self::Processed { .. } => ItemStatus::Processed,
            Self::Skipped { .. } => ItemStatus::Skipped,
            Self::Failed { .. } => ItemStatus::Failed,
        }
    }

    /// Terminal states are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Processed { .. } | Self::Skipped { .. } | Self::Failed { .. }
        )
    }
}

/// A URL found by one of the discovery producers. Unique per `(source_id, url)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub canonical_url: String,
    pub state: ItemState,
    pub method: DiscoveryMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
    pub retry_count: u32,
    pub crawl_depth: u32,
    pub change_frequency: ChangeFrequency,
    pub freshness_risk: FreshnessRisk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_run_id: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveredItem {
    pub fn status(&self) -> ItemStatus {
        self.state.status()
    }
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Content classification decided at fetch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentClass {
    Html,
    TextPdf,
    ScannedPdf,
    Other,
}

str_enum!(ContentClass {
    Html => "HTML",
    TextPdf => "TEXT_PDF",
    ScannedPdf => "SCANNED_PDF",
    Other => "OTHER",
});

/// Auxiliary freshness flag on evidence. The only mutable part of a capture
/// besides `last_verified_at` and the OCR text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StalenessStatus {
    Fresh,
    Stale,
}

str_enum!(StalenessStatus { Fresh => "FRESH", Stale => "STALE" });

/// An immutable capture of a fetched document. Unique by `(url, content_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub content_hash: String,
    /// Raw response body exactly as fetched.
    #[serde(skip)]
    pub raw_content: Vec<u8>,
    pub content_type: Option<String>,
    pub content_class: ContentClass,
    pub fetched_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    pub staleness: StalenessStatus,
    /// Text recovered by OCR for scanned PDFs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Kind of value an atomic claim asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Date,
    NumericThreshold,
    FreeText,
    Reference,
}

str_enum!(ValueType {
    Date => "date",
    NumericThreshold => "numeric_threshold",
    FreeText => "free_text",
    Reference => "reference",
});

/// A single grounded fact: the exact quote must occur verbatim in the evidence text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicClaim {
    pub id: String,
    pub evidence_id: String,
    pub concept: String,
    pub exact_quote: String,
    pub normalized_value: String,
    pub value_type: ValueType,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<NaiveDate>,
    /// Authority of the source the evidence came from.
    pub authority: AuthorityLevel,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Lifecycle of a composed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleStatus {
    Draft,
    PendingReview,
    Approved,
    Published,
    Deprecated,
    Rejected,
}

str_enum!(RuleStatus {
    Draft => "DRAFT",
    PendingReview => "PENDING_REVIEW",
    Approved => "APPROVED",
    Published => "PUBLISHED",
    Deprecated => "DEPRECATED",
    Rejected => "REJECTED",
});

impl RuleStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Forward: DRAFT → {APPROVED, PENDING_REVIEW} → APPROVED → PUBLISHED.
    /// Branches: any live state → DEPRECATED (arbitration/override),
    /// DRAFT/PENDING_REVIEW/APPROVED → REJECTED (override).
    pub fn can_transition_to(&self, next: RuleStatus) -> bool {
        use RuleStatus::*;
        matches!(
            (self, next),
            (Draft, Approved)
                | (Draft, PendingReview)
                | (PendingReview, Approved)
                | (Approved, Published)
                | (Draft | PendingReview | Approved | Published, Deprecated)
                | (Draft | PendingReview | Approved, Rejected)
        )
    }

    /// Rules that still compete for a concept/period.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Deprecated | Self::Rejected)
    }
}

/// Grounding for a rule: which claim, in which evidence, quoting what.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePointer {
    pub claim_id: String,
    pub evidence_id: String,
    pub url: String,
    pub exact_quote: String,
}

/// A composed, versioned regulatory assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub concept: String,
    pub value: String,
    pub value_type: ValueType,
    pub status: RuleStatus,
    pub authority: AuthorityLevel,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<NaiveDate>,
    pub sources: Vec<SourcePointer>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn snapshot(&self) -> RuleSnapshot {
        RuleSnapshot {
            rule_id: self.id.clone(),
            value: self.value.clone(),
            status: self.status,
            authority: self.authority,
            confidence: self.confidence,
            effective_from: self.effective_from,
            created_at: self.created_at,
        }
    }
}

/// The subset of a rule that arbitration decides on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub rule_id: String,
    pub value: String,
    pub status: RuleStatus,
    pub authority: AuthorityLevel,
    pub confidence: f64,
    pub effective_from: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// One criterion of the tie-break policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    Authority,
    Confidence,
    Recency,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

str_enum!(ConflictStatus { Open => "OPEN", Resolved => "RESOLVED" });

/// Audit of how a conflict was closed, including every input considered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionAudit {
    pub winner: String,
    pub losers: Vec<String>,
    /// Criterion that separated the winner from the runner-up, if any.
    pub deciding_criterion: Option<TieBreak>,
    pub criteria: Vec<TieBreak>,
    pub inputs: Vec<RuleSnapshot>,
    pub decided_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// Two or more live rules asserting different values for one concept/period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub concept: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<NaiveDate>,
    pub rule_ids: Vec<String>,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionAudit>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Backfill runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillMode {
    Sitemap,
    Pagination,
    Archive,
}

str_enum!(BackfillMode {
    Sitemap => "SITEMAP",
    Pagination => "PAGINATION",
    Archive => "ARCHIVE",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

str_enum!(BackfillStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl BackfillStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Structured error-log entry; enough to resume the failing part later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillError {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Where it failed: `listing`, `enqueue`, `config`.
    pub phase: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Parameters of an operator-triggered historical crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillParams {
    pub sources: Vec<String>,
    pub mode: BackfillMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<NaiveDate>,
    pub max_urls: usize,
    pub max_urls_per_source: usize,
    pub delay_ms: u64,
    pub dry_run: bool,
}

/// Audit record of one backfill invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRun {
    pub id: String,
    pub params: BackfillParams,
    pub status: BackfillStatus,
    pub discovered_count: usize,
    pub queued_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
    pub errors: Vec<BackfillError>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Knowledge graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Supersedes,
}

str_enum!(EdgeKind { Supersedes => "supersedes" });

/// Directed relationship between published rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_rule: String,
    pub to_rule: String,
    pub kind: EdgeKind,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// One named queue per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    Fetch,
    Ocr,
    Extract,
    Compose,
    Review,
    Arbitrate,
    Release,
    /// Consumed by humans outside the process; no in-process worker.
    HumanReview,
}

str_enum!(QueueName {
    Fetch => "fetch",
    Ocr => "ocr",
    Extract => "extract",
    Compose => "compose",
    Review => "review",
    Arbitrate => "arbitrate",
    Release => "release",
    HumanReview => "human-review",
});

impl QueueName {
    /// Queues with an in-process worker, in pipeline order.
    pub const WORKER_QUEUES: [QueueName; 7] = [
        Self::Fetch,
        Self::Ocr,
        Self::Extract,
        Self::Compose,
        Self::Review,
        Self::Arbitrate,
        Self::Release,
    ];
}
