//! Application configuration for the regulatory-truth pipeline.
//!
//! User config lives at `~/.regtruth/regtruth.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RegTruthError, Result};
use crate::types::{AuthorityLevel, ChangeFrequency, PriorityTier, QueueName, TieBreak, ValueType};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "regtruth.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".regtruth";

// ---------------------------------------------------------------------------
// Config structs (matching regtruth.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Auto-approval gate.
    #[serde(default)]
    pub review: ReviewConfig,

    /// Claim extraction thresholds and concept patterns.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Conflict tie-break policy.
    #[serde(default)]
    pub arbitration: ArbitrationConfig,

    /// Per-domain politeness bounds.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Per-stage queue contracts, keyed by queue name.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// Continuous drain loop pacing.
    #[serde(default)]
    pub drain: DrainConfig,

    /// Backfill defaults and kill switch.
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Fetch stage limits.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// External OCR command for scanned PDFs.
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Re-verification ages per freshness tier.
    #[serde(default)]
    pub staleness: StalenessConfig,

    /// Registered regulatory sources.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file. A leading `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.regtruth/regtruth.db".into()
}

impl DefaultsConfig {
    /// Resolve `db_path`, expanding `~`.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        expand_home(&self.db_path)
    }
}

/// `[review]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Confidence a rule must exceed to be approved without a human.
    #[serde(default = "default_auto_approve")]
    pub auto_approve_threshold: f64,

    /// Minimum number of grounded source pointers for auto-approval.
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: default_auto_approve(),
            min_sources: default_min_sources(),
        }
    }
}

fn default_auto_approve() -> f64 {
    0.85
}
fn default_min_sources() -> usize {
    1
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Claims below this confidence are discarded, not persisted.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Concepts the pattern extractor looks for.
    #[serde(default = "default_concepts")]
    pub concepts: Vec<ConceptPattern>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            concepts: default_concepts(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_concepts() -> Vec<ConceptPattern> {
    vec![
        ConceptPattern {
            id: "vat-standard-rate".into(),
            keywords: vec![r"(?i)standard\s+(vat\s+)?rate".into(), r"(?i)opća\s+stopa".into()],
            value_type: Some(ValueType::NumericThreshold),
        },
        ConceptPattern {
            id: "vat-registration-threshold".into(),
            keywords: vec![r"(?i)registration\s+threshold".into(), r"(?i)prag\s+za\s+ulazak".into()],
            value_type: Some(ValueType::NumericThreshold),
        },
    ]
}

/// `[[extraction.concepts]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptPattern {
    /// Stable concept identifier (e.g. `vat-standard-rate`).
    pub id: String,
    /// Regexes; a sentence mentioning any of them is a candidate.
    pub keywords: Vec<String>,
    /// Expected value type; `None` accepts the first value found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
}

/// `[arbitration]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationConfig {
    /// Tie-break criteria, applied in order.
    #[serde(default = "default_criteria")]
    pub criteria: Vec<TieBreak>,

    /// Confidence differences at or below this are treated as ties.
    #[serde(default)]
    pub confidence_epsilon: f64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            criteria: default_criteria(),
            confidence_epsilon: 0.0,
        }
    }
}

fn default_criteria() -> Vec<TieBreak> {
    vec![TieBreak::Authority, TieBreak::Confidence, TieBreak::Recency]
}

/// `[rate_limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Lower bound of the jittered delay between requests to one domain.
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    /// Upper bound of the jittered delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Concurrent in-flight requests per domain.
    #[serde(default = "default_domain_concurrency")]
    pub max_concurrent: u32,

    /// Per-domain overrides.
    #[serde(default)]
    pub domains: Vec<DomainRateLimit>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            max_concurrent: default_domain_concurrency(),
            domains: Vec::new(),
        }
    }
}

fn default_min_delay() -> u64 {
    1_000
}
fn default_max_delay() -> u64 {
    3_000
}
fn default_domain_concurrency() -> u32 {
    1
}

/// `[[rate_limits.domains]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRateLimit {
    pub domain: String,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_domain_concurrency")]
    pub max_concurrent: u32,
}

/// Queue contract for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Jobs processed in parallel by this stage's worker.
    pub concurrency: u32,
    /// Token-bucket size: jobs allowed per window.
    pub max_jobs_per_window: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Attempts before a job is dead-lettered.
    pub attempts: u32,
    /// Base of the exponential backoff curve.
    pub backoff_base_ms: u64,
    /// Completed jobs retained for deduplication.
    pub keep_completed: u32,
    /// Dead-lettered jobs retained for inspection.
    pub keep_failed: u32,
}

impl QueueConfig {
    /// Stage defaults: fetch is the most network-restrictive, review and
    /// arbitration are compute-bound.
    pub fn default_for(queue: QueueName) -> Self {
        let base = Self {
            concurrency: 4,
            max_jobs_per_window: 120,
            window_secs: 60,
            attempts: 3,
            backoff_base_ms: 2_000,
            keep_completed: 1_000,
            keep_failed: 5_000,
        };
        match queue {
            QueueName::Fetch => Self {
                concurrency: 2,
                max_jobs_per_window: 30,
                backoff_base_ms: 10_000,
                ..base
            },
            QueueName::Ocr => Self {
                concurrency: 1,
                max_jobs_per_window: 10,
                ..base
            },
            QueueName::Review | QueueName::Arbitrate => Self {
                concurrency: 2,
                max_jobs_per_window: 60,
                ..base
            },
            // Composition reads and rewrites a whole concept; one at a time.
            QueueName::Compose => Self {
                concurrency: 1,
                ..base
            },
            QueueName::Extract | QueueName::Release => base,
            QueueName::HumanReview => Self {
                concurrency: 0,
                attempts: 1,
                ..base
            },
        }
    }
}

/// `[queues]` section: a map from queue name to its contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueuesConfig(pub BTreeMap<String, QueueConfig>);

impl Default for QueuesConfig {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for queue in QueueName::WORKER_QUEUES {
            map.insert(queue.as_str().to_string(), QueueConfig::default_for(queue));
        }
        Self(map)
    }
}

impl QueuesConfig {
    /// Contract for `queue`, falling back to the stage default.
    pub fn for_queue(&self, queue: QueueName) -> QueueConfig {
        self.0
            .get(queue.as_str())
            .copied()
            .unwrap_or_else(|| QueueConfig::default_for(queue))
    }
}

/// `[drain]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Sleep between cycles while there is backlog.
    #[serde(default = "default_drain_min")]
    pub min_sleep_ms: u64,
    /// Ceiling for the idle backoff.
    #[serde(default = "default_drain_max")]
    pub max_sleep_ms: u64,
    /// Pending items promoted to the fetch queue per cycle.
    #[serde(default = "default_drain_batch")]
    pub batch_size: usize,
    /// Seconds after which an `active` job counts as abandoned by its worker.
    #[serde(default = "default_drain_lease")]
    pub lease_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            min_sleep_ms: default_drain_min(),
            max_sleep_ms: default_drain_max(),
            batch_size: default_drain_batch(),
            lease_secs: default_drain_lease(),
        }
    }
}

fn default_drain_min() -> u64 {
    1_000
}
fn default_drain_max() -> u64 {
    60_000
}
fn default_drain_batch() -> usize {
    50
}
fn default_drain_lease() -> u64 {
    600
}

/// `[backfill]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Env var that must be `true` for non-dry-run backfills.
    #[serde(default = "default_kill_switch_env")]
    pub kill_switch_env: String,
    #[serde(default = "default_backfill_max")]
    pub max_urls: usize,
    #[serde(default = "default_backfill_per_source")]
    pub max_urls_per_source: usize,
    /// Delay between listing requests.
    #[serde(default = "default_backfill_delay")]
    pub delay_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            kill_switch_env: default_kill_switch_env(),
            max_urls: default_backfill_max(),
            max_urls_per_source: default_backfill_per_source(),
            delay_ms: default_backfill_delay(),
        }
    }
}

fn default_kill_switch_env() -> String {
    "REGTRUTH_BACKFILL_ENABLED".into()
}
fn default_backfill_max() -> usize {
    1_000
}
fn default_backfill_per_source() -> usize {
    500
}
fn default_backfill_delay() -> u64 {
    2_000
}

impl BackfillConfig {
    /// Whether the kill switch is explicitly enabled in the environment.
    pub fn enabled(&self) -> bool {
        matches!(
            std::env::var(&self.kill_switch_env).as_deref().map(str::trim),
            Ok("true" | "1" | "yes")
        )
    }
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_body")]
    pub max_body_bytes: u64,
    /// Item-level retries before a transiently failing item is FAILED.
    #[serde(default = "default_item_retries")]
    pub max_item_retries: u32,
    /// Extracted text characters per PDF byte below which a PDF is "scanned".
    #[serde(default = "default_pdf_density")]
    pub pdf_text_density: f64,
    /// Allow private/loopback hosts (tests, local mirrors).
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_body_bytes: default_max_body(),
            max_item_retries: default_item_retries(),
            pdf_text_density: default_pdf_density(),
            allow_private_hosts: false,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_body() -> u64 {
    25 * 1024 * 1024
}
fn default_item_retries() -> u32 {
    3
}
fn default_pdf_density() -> f64 {
    0.01
}

/// `[ocr]` section. The command reads PDF bytes on stdin and prints text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[staleness]` section: days before evidence must be re-verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    #[serde(default = "default_high_days")]
    pub high_risk_days: i64,
    #[serde(default = "default_medium_days")]
    pub medium_risk_days: i64,
    #[serde(default = "default_low_days")]
    pub low_risk_days: i64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            high_risk_days: default_high_days(),
            medium_risk_days: default_medium_days(),
            low_risk_days: default_low_days(),
        }
    }
}

fn default_high_days() -> i64 {
    1
}
fn default_medium_days() -> i64 {
    7
}
fn default_low_days() -> i64 {
    30
}

/// Listing structure a source publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingKind {
    Sitemap,
    Rss,
    Pagination,
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier, used as the job-ID prefix.
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub listing: ListingKind,
    /// Sitemap index / sitemap / RSS feed / first listing page.
    pub listing_url: String,
    /// Paginated listing URL containing `{page}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_template: Option<String>,
    /// Archive listing URL containing `{year}` (and optionally `{page}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_template: Option<String>,
    /// Regex an `<a href>` must match to be a document link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_pattern: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_tier")]
    pub tier: PriorityTier,
    #[serde(default = "default_authority")]
    pub authority: AuthorityLevel,
    #[serde(default = "default_change_frequency")]
    pub change_frequency: ChangeFrequency,
}

fn default_max_pages() -> u32 {
    50
}
fn default_tier() -> PriorityTier {
    PriorityTier::Medium
}
fn default_authority() -> AuthorityLevel {
    AuthorityLevel::SecondaryGuidance
}
fn default_change_frequency() -> ChangeFrequency {
    ChangeFrequency::Unknown
}

impl AppConfig {
    /// Look up a registered source by id.
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.review.auto_approve_threshold) {
            return Err(RegTruthError::config(
                "review.auto_approve_threshold must be within [0, 1]",
            ));
        }
        if !unit.contains(&self.extraction.min_confidence) {
            return Err(RegTruthError::config(
                "extraction.min_confidence must be within [0, 1]",
            ));
        }
        if self.arbitration.criteria.is_empty() {
            return Err(RegTruthError::config("arbitration.criteria must not be empty"));
        }
        if self.rate_limits.min_delay_ms > self.rate_limits.max_delay_ms {
            return Err(RegTruthError::config(
                "rate_limits.min_delay_ms must not exceed max_delay_ms",
            ));
        }
        for d in &self.rate_limits.domains {
            if d.min_delay_ms > d.max_delay_ms || d.max_concurrent == 0 {
                return Err(RegTruthError::config(format!(
                    "invalid rate limit for domain {}",
                    d.domain
                )));
            }
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id.as_str()) {
                return Err(RegTruthError::config(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            if source.id.contains(':') {
                return Err(RegTruthError::config(format!(
                    "source id '{}' must not contain ':'",
                    source.id
                )));
            }
            if let Some(t) = &source.pagination_template {
                if !t.contains("{page}") {
                    return Err(RegTruthError::config(format!(
                        "source '{}': pagination_template must contain {{page}}",
                        source.id
                    )));
                }
            }
            if let Some(t) = &source.archive_template {
                if !t.contains("{year}") {
                    return Err(RegTruthError::config(format!(
                        "source '{}': archive_template must contain {{year}}",
                        source.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.regtruth/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| RegTruthError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.regtruth/regtruth.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RegTruthError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        RegTruthError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RegTruthError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RegTruthError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RegTruthError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| RegTruthError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
