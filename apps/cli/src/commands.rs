//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use regtruth_core::{
    CycleReport, DrainProgress, DrainSummary, HealthSnapshot, Orchestrator, StageContext, Trigger,
    human_decision,
};
use regtruth_crawler::{DomainRateLimiter, Fetcher};
use regtruth_discovery::BackfillRunner;
use regtruth_shared::{
    AppConfig, BackfillMode, BackfillParams, QueueName, RegTruthError, RuleStatus, init_config,
    load_config, load_config_from,
};
use regtruth_storage::Storage;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// RegTruth: grounded regulatory rules from official sources.
#[derive(Parser)]
#[command(
    name = "regtruth",
    version,
    about = "Discover regulatory documents and turn them into grounded, published rules.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.regtruth/regtruth.toml).
    #[arg(long, env = "REGTRUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Historical discovery runs.
    Backfill {
        #[command(subcommand)]
        action: BackfillAction,
    },

    /// Registered sources.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Read the listings of every due source once.
    Discover {
        /// Ignore the per-tier cadence.
        #[arg(long)]
        force: bool,
    },

    /// Run the stage workers continuously until Ctrl-C.
    Drain {
        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<usize>,
    },

    /// Pipeline maintenance.
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Inspect and review rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Inspect queues.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Print a health snapshot as JSON.
    Status,

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ModeArg {
    Sitemap,
    Pagination,
    Archive,
}

impl From<ModeArg> for BackfillMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sitemap => BackfillMode::Sitemap,
            ModeArg::Pagination => BackfillMode::Pagination,
            ModeArg::Archive => BackfillMode::Archive,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum BackfillAction {
    /// Start a backfill run. Requires the kill switch unless --dry-run.
    Run {
        /// Source id (repeatable).
        #[arg(long = "source", required = true)]
        sources: Vec<String>,

        /// Listing structure to walk.
        #[arg(long, value_enum, default_value = "sitemap")]
        mode: ModeArg,

        /// Total URL cap (defaults to [backfill].max_urls).
        #[arg(long)]
        max_urls: Option<usize>,

        /// Per-source URL cap (defaults to [backfill].max_urls_per_source).
        #[arg(long)]
        max_urls_per_source: Option<usize>,

        /// Delay between listing requests in ms (defaults to [backfill].delay_ms).
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Keep candidates published on or after this date (YYYY-MM-DD).
        #[arg(long)]
        date_from: Option<NaiveDate>,

        /// Keep candidates published on or before this date (YYYY-MM-DD).
        #[arg(long)]
        date_to: Option<NaiveDate>,

        /// Walk and count without enqueueing anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show one run as JSON.
    Status { id: String },
    /// Ask a running backfill to stop at its next checkpoint.
    Cancel { id: String },
    /// Re-run the sources that failed in a finished run.
    Resume { id: String },
    /// List recent runs.
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub(crate) enum SourcesAction {
    /// List registered sources.
    List,
}

#[derive(Subcommand)]
pub(crate) enum PipelineAction {
    /// Run one batch of every stage and exit.
    RunOnce,
}

#[derive(Subcommand)]
pub(crate) enum RulesAction {
    /// List rules.
    List {
        /// Only PUBLISHED rules, in retrieval order.
        #[arg(long)]
        published: bool,

        /// Restrict --published output to one concept.
        #[arg(long)]
        concept: Option<String>,

        /// Filter by status (DRAFT, PENDING_REVIEW, APPROVED, ...).
        #[arg(long)]
        status: Option<RuleStatus>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Approve a rule awaiting review.
    Approve {
        id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        reviewer: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Reject a rule.
    Reject {
        id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        reviewer: String,
        #[arg(long)]
        note: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// List dead-lettered jobs.
    DeadLetters {
        #[arg(long)]
        queue: Option<QueueName>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Move a dead-lettered job back to waiting.
    Retry { queue: QueueName, id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "regtruth=info",
        1 => "regtruth=debug",
        _ => "regtruth=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&resolve_config(&cli)?),
        };
    }

    let config = Arc::new(resolve_config(&cli)?);
    if let Command::Sources { action: SourcesAction::List } = &cli.command {
        return cmd_sources_list(&config);
    }
    // A real backfill with the kill switch off must not even create the database.
    if let Command::Backfill {
        action: BackfillAction::Run { dry_run: false, .. },
    } = &cli.command
    {
        if !config.backfill.enabled() {
            return Err(RegTruthError::KillSwitch {
                env_var: config.backfill.kill_switch_env.clone(),
            }
            .into());
        }
    }
    let storage = Arc::new(open_storage(&config).await?);

    match cli.command {
        Command::Backfill { action } => cmd_backfill(action, &storage, &config).await,
        Command::Discover { force } => cmd_discover(&storage, config, force).await,
        Command::Drain { max_cycles } => cmd_drain(&storage, config, max_cycles).await,
        Command::Pipeline {
            action: PipelineAction::RunOnce,
        } => cmd_run_once(&storage, config).await,
        Command::Rules { action } => cmd_rules(action, &storage, config).await,
        Command::Queue { action } => cmd_queue(action, &storage).await,
        Command::Status => cmd_status(&storage).await,
        Command::Sources { .. } | Command::Config { .. } => Ok(()),
    }
}

fn resolve_config(cli: &Cli) -> Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = config.defaults.resolved_db_path()?;
    info!(path = %path.display(), "opening database");
    Ok(Storage::open(&path).await?)
}

fn fetcher(config: &AppConfig) -> Result<Fetcher> {
    let limiter = Arc::new(DomainRateLimiter::new(config.rate_limits.clone()));
    Ok(Fetcher::new(&config.fetch, limiter)?)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

async fn cmd_backfill(action: BackfillAction, storage: &Storage, config: &AppConfig) -> Result<()> {
    match action {
        BackfillAction::Run {
            sources,
            mode,
            max_urls,
            max_urls_per_source,
            delay_ms,
            date_from,
            date_to,
            dry_run,
        } => {
            let params = BackfillParams {
                sources,
                mode: mode.into(),
                date_from,
                date_to,
                max_urls: max_urls.unwrap_or(config.backfill.max_urls),
                max_urls_per_source: max_urls_per_source.unwrap_or(config.backfill.max_urls_per_source),
                delay_ms: delay_ms.unwrap_or(config.backfill.delay_ms),
                dry_run,
            };
            let fetcher = fetcher(config)?;
            let runner = BackfillRunner::new(storage, &fetcher, config);
            info!(sources = ?params.sources, mode = %params.mode, dry_run, "starting backfill");
            let report = runner.run(params).await?;
            print_backfill_summary(&report);
            Ok(())
        }
        BackfillAction::Status { id } => {
            let run = storage
                .get_backfill_run(&id)
                .await?
                .ok_or_else(|| eyre!("no backfill run '{id}'"))?;
            print_json(&run)
        }
        BackfillAction::Cancel { id } => {
            if storage.cancel_backfill_run(&id).await? {
                println!("Cancellation requested for {id}");
                Ok(())
            } else {
                Err(eyre!("backfill run '{id}' is not running"))
            }
        }
        BackfillAction::Resume { id } => {
            let fetcher = fetcher(config)?;
            let report = BackfillRunner::new(storage, &fetcher, config).resume(&id).await?;
            print_backfill_summary(&report);
            Ok(())
        }
        BackfillAction::List { limit } => {
            let runs = storage.list_backfill_runs(limit).await?;
            if runs.is_empty() {
                println!("No backfill runs.");
            }
            for run in runs {
                println!(
                    "{}  {:<9}  {:<10}  {}discovered={} queued={} skipped={} errors={}",
                    run.id,
                    run.status,
                    run.params.mode,
                    if run.params.dry_run { "[dry-run] " } else { "" },
                    run.discovered_count,
                    run.queued_count,
                    run.skipped_count,
                    run.error_count,
                );
            }
            Ok(())
        }
    }
}

fn print_backfill_summary(report: &regtruth_discovery::BackfillReport) {
    let run = &report.run;
    println!();
    println!("  Backfill {}", run.status);
    println!("  Run:        {}", run.id);
    println!("  Discovered: {}", run.discovered_count);
    if run.params.dry_run {
        println!("  Would queue: {}", report.would_queue);
        println!("  Would skip:  {}", report.would_skip);
    } else {
        println!("  Queued:     {}", run.queued_count);
        println!("  Skipped:    {}", run.skipped_count);
    }
    println!("  Errors:     {}", run.error_count);
    for err in run.errors.iter().take(10) {
        println!(
            "    [{}] {} {}: {}",
            err.phase,
            err.source_id,
            err.url.as_deref().unwrap_or("-"),
            err.message
        );
    }
    println!();
}

// ---------------------------------------------------------------------------
// Sources & discovery
// ---------------------------------------------------------------------------

fn cmd_sources_list(config: &AppConfig) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured. Add [[sources]] entries to the config file.");
        return Ok(());
    }
    for source in &config.sources {
        println!(
            "{:<20} {:<11} {:<9} {:<20} {}",
            source.id,
            format!("{:?}", source.listing).to_lowercase(),
            source.tier,
            source.authority.to_string(),
            source.listing_url
        );
    }
    Ok(())
}

async fn cmd_discover(storage: &Arc<Storage>, config: Arc<AppConfig>, force: bool) -> Result<()> {
    let orchestrator = Orchestrator::from_config(storage.clone(), config)?;
    for pass in orchestrator.discover(force).await? {
        if !pass.ran {
            println!("{:<20} not due", pass.source_id);
            continue;
        }
        println!(
            "{:<20} discovered={} queued={} skipped={} errors={}",
            pass.source_id,
            pass.discovered,
            pass.queued,
            pass.skipped,
            pass.errors.len()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

async fn cmd_run_once(storage: &Arc<Storage>, config: Arc<AppConfig>) -> Result<()> {
    let orchestrator = Orchestrator::from_config(storage.clone(), config.clone())?;
    orchestrator.recover().await?;
    let ctx = StageContext::new(config, Trigger::RunOnce);
    let report = orchestrator.run_once(&ctx).await?;
    print_json(&report)?;
    if !report.errors.is_empty() {
        return Err(eyre!("{} stage error(s) during the cycle", report.errors.len()));
    }
    Ok(())
}

async fn cmd_drain(storage: &Arc<Storage>, config: Arc<AppConfig>, max_cycles: Option<usize>) -> Result<()> {
    let orchestrator = Orchestrator::from_config(storage.clone(), config)?;
    let progress = CliProgress::new();
    let shutdown = async {
        // A failed signal handler install leaves the drain bounded by --max-cycles.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = orchestrator.drain(&progress, max_cycles, shutdown).await?;

    println!();
    println!("  Drain stopped");
    println!("  Cycles:     {}", summary.cycles);
    println!("  Processed:  {}", summary.processed);
    println!("  Discovered: {}", summary.discovered);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Drain progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl DrainProgress for CliProgress {
    fn cycle(&self, number: usize, report: &CycleReport) {
        self.spinner.set_message(format!(
            "Cycle {number}: {} job(s), {} promoted, {} stale",
            report.processed(),
            report.promoted,
            report.sweep.marked_stale
        ));
        for error in &report.errors {
            self.spinner.println(format!("  ! {error}"));
        }
    }

    fn idle(&self, sleep: Duration) {
        self.spinner
            .set_message(format!("Waiting {:.1}s for work", sleep.as_secs_f64()));
    }

    fn done(&self, _summary: &DrainSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Rules & queues
// ---------------------------------------------------------------------------

async fn cmd_rules(action: RulesAction, storage: &Storage, config: Arc<AppConfig>) -> Result<()> {
    match action {
        RulesAction::List {
            published,
            concept,
            status,
            limit,
        } => {
            let rules = if published {
                storage.published_rules(concept.as_deref()).await?
            } else {
                storage.list_rules(status, limit).await?
            };
            if rules.is_empty() {
                println!("No rules.");
            }
            for rule in rules.iter().take(limit) {
                println!(
                    "{}  {:<15} {:<28} {:<12} {:<20} conf={:.2} sources={}",
                    rule.id,
                    rule.status,
                    rule.concept,
                    rule.value,
                    rule.authority.to_string(),
                    rule.confidence,
                    rule.sources.len()
                );
            }
            Ok(())
        }
        RulesAction::Approve { id, reviewer, note } => {
            let ctx = StageContext::new(config, Trigger::RunOnce);
            let status = human_decision(storage, &ctx, &id, true, &reviewer, note.as_deref()).await?;
            println!("{id} -> {status} (queued for release)");
            Ok(())
        }
        RulesAction::Reject { id, reviewer, note } => {
            let ctx = StageContext::new(config, Trigger::RunOnce);
            let status = human_decision(storage, &ctx, &id, false, &reviewer, note.as_deref()).await?;
            println!("{id} -> {status}");
            Ok(())
        }
    }
}

async fn cmd_queue(action: QueueAction, storage: &Storage) -> Result<()> {
    match action {
        QueueAction::DeadLetters { queue, limit } => {
            let dead = storage.list_dead_letters(queue, limit).await?;
            if dead.is_empty() {
                println!("No dead-lettered jobs.");
            }
            for job in dead {
                println!(
                    "{:<12} {}  attempts={}  {}  {}",
                    job.queue,
                    job.id,
                    job.attempts,
                    job.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    job.error
                );
            }
            Ok(())
        }
        QueueAction::Retry { queue, id } => {
            if storage.requeue_dead(queue, &id).await? {
                println!("Requeued {queue}/{id}");
                Ok(())
            } else {
                Err(eyre!("no dead-lettered job {queue}/{id}"))
            }
        }
    }
}

async fn cmd_status(storage: &Storage) -> Result<()> {
    let snapshot = HealthSnapshot::collect(storage).await?;
    print_json(&snapshot)
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn backfill_run_parses_repeatable_sources_and_dates() {
        let cli = Cli::try_parse_from([
            "regtruth",
            "backfill",
            "run",
            "--source",
            "porezna",
            "--source",
            "fina",
            "--mode",
            "archive",
            "--date-from",
            "2020-01-01",
            "--dry-run",
        ])
        .unwrap();
        let Command::Backfill {
            action:
                BackfillAction::Run {
                    sources,
                    mode,
                    date_from,
                    dry_run,
                    ..
                },
        } = cli.command
        else {
            panic!("expected backfill run");
        };
        assert_eq!(sources, vec!["porezna".to_string(), "fina".to_string()]);
        assert_eq!(BackfillMode::from(mode), BackfillMode::Archive);
        assert_eq!(date_from, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert!(dry_run);
    }

    #[test]
    fn backfill_run_requires_a_source() {
        assert!(Cli::try_parse_from(["regtruth", "backfill", "run"]).is_err());
    }

    #[test]
    fn queue_names_parse_from_their_stable_form() {
        let cli = Cli::try_parse_from(["regtruth", "queue", "retry", "human-review", "r-1"]).unwrap();
        let Command::Queue {
            action: QueueAction::Retry { queue, id },
        } = cli.command
        else {
            panic!("expected queue retry");
        };
        assert_eq!(queue, QueueName::HumanReview);
        assert_eq!(id, "r-1");
    }
}
