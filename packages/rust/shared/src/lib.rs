//! Shared types, error model, and configuration for the regulatory-truth pipeline.
//!
//! This crate is the foundation depended on by all other crates.
//! It provides:
//! - [`RegTruthError`] — the unified error type
//! - Domain types ([`DiscoveredItem`], [`Evidence`], [`AtomicClaim`], [`Rule`], [`Conflict`], ...)
//! - URL canonicalization and deterministic job IDs ([`canonicalize`], [`job_id`])
//! - Configuration ([`AppConfig`], config loading)

pub mod canonical;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use canonical::{canonicalize, canonicalize_url, domain_of, job_id, job_id_for_canonical, sha256_hex};
pub use config::{
    AppConfig, ArbitrationConfig, BackfillConfig, ConceptPattern, DomainRateLimit, DrainConfig,
    ExtractionConfig, FetchConfig, ListingKind, OcrConfig, QueueConfig, QueuesConfig,
    RateLimitsConfig, ReviewConfig, SourceConfig, StalenessConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{RegTruthError, Result};
pub use types::{
    AtomicClaim, AuthorityLevel, BackfillError, BackfillMode, BackfillParams, BackfillRun,
    BackfillStatus, ChangeFrequency, Conflict, ConflictStatus, ContentClass, DiscoveredItem,
    DiscoveryMethod, EdgeKind, Evidence, FreshnessRisk, GraphEdge, ItemState, ItemStatus,
    PriorityTier, QueueName, ResolutionAudit, Rule, RuleSnapshot, RuleStatus, SourcePointer,
    StalenessStatus, TieBreak, ValueType,
};
