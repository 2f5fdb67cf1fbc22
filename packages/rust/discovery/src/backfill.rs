//! Operator-triggered historical discovery.
//!
//! A run walks the listings of the selected sources in the requested mode,
//! filters candidates by date, and registers them on the shared discovery
//! surface until the total or per-source cap is reached. Counting continues
//! past the caps so the operator sees the true listing size.
//!
//! Dry runs perform the same walk but only the run record is written.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use regtruth_crawler::Fetcher;
use regtruth_shared::{
    AppConfig, BackfillError, BackfillParams, BackfillRun, BackfillStatus, RegTruthError, Result,
    SourceConfig, canonicalize,
};
use regtruth_storage::Storage;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::listing::{ListingWalker, backfill_targets, link_pattern};
use crate::surface::{DiscoveryQueue, RegisterOutcome};

/// A finished (or cancelled) run plus the counts a dry run would have produced.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub run: BackfillRun,
    /// Candidates that would be queued; equals `queued_count` for real runs.
    pub would_queue: usize,
    /// Candidates already known; equals `skipped_count` for real runs.
    pub would_skip: usize,
}

pub struct BackfillRunner<'a> {
    storage: &'a Storage,
    fetcher: &'a Fetcher,
    config: &'a AppConfig,
    enabled: bool,
}

/// Mutable per-run accounting.
struct Tally {
    run: BackfillRun,
    would_queue: usize,
    would_skip: usize,
    seen: HashSet<(String, String)>,
}

impl Tally {
    fn error(&mut self, source_id: &str, url: Option<String>, phase: &str, message: String) {
        warn!(source = source_id, url = url.as_deref().unwrap_or(""), phase, %message, "backfill error");
        self.run.errors.push(BackfillError {
            source_id: source_id.to_string(),
            url,
            phase: phase.to_string(),
            message,
            at: Utc::now(),
        });
        self.run.error_count = self.run.errors.len();
    }

    fn at_cap(&self, per_source: usize) -> bool {
        let params = &self.run.params;
        self.would_queue >= params.max_urls || per_source >= params.max_urls_per_source
    }
}

impl<'a> BackfillRunner<'a> {
    pub fn new(storage: &'a Storage, fetcher: &'a Fetcher, config: &'a AppConfig) -> Self {
        Self {
            storage,
            fetcher,
            config,
            enabled: config.backfill.enabled(),
        }
    }

    /// Override the kill switch read from the environment.
    pub fn kill_switch(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Fail before any side effect when a real run is not allowed.
    pub fn check_kill_switch(&self, params: &BackfillParams) -> Result<()> {
        if !params.dry_run && !self.enabled {
            return Err(RegTruthError::KillSwitch {
                env_var: self.config.backfill.kill_switch_env.clone(),
            });
        }
        Ok(())
    }

    fn validate(&self, params: &BackfillParams) -> Result<()> {
        if params.sources.is_empty() {
            return Err(RegTruthError::validation("at least one --source is required"));
        }
        for id in &params.sources {
            if self.config.source(id).is_none() {
                return Err(RegTruthError::validation(format!("unknown source '{id}'")));
            }
        }
        if let (Some(from), Some(to)) = (params.date_from, params.date_to) {
            if from > to {
                return Err(RegTruthError::validation(format!(
                    "date-from {from} is after date-to {to}"
                )));
            }
        }
        if params.max_urls == 0 || params.max_urls_per_source == 0 {
            return Err(RegTruthError::validation("URL caps must be positive"));
        }
        Ok(())
    }

    /// Start and execute a new run.
    pub async fn run(&self, params: BackfillParams) -> Result<BackfillReport> {
        self.check_kill_switch(&params)?;
        self.validate(&params)?;

        let run = BackfillRun {
            id: Uuid::now_v7().to_string(),
            params,
            status: BackfillStatus::Running,
            discovered_count: 0,
            queued_count: 0,
            skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        self.storage.insert_backfill_run(&run).await?;
        self.execute(run).await
    }

    /// Re-run the sources that logged errors in a finished run, with the
    /// original parameters. Creates a new run record.
    pub async fn resume(&self, run_id: &str) -> Result<BackfillReport> {
        let previous = self
            .storage
            .get_backfill_run(run_id)
            .await?
            .ok_or_else(|| RegTruthError::NotFound(format!("backfill run {run_id}")))?;
        if !previous.status.is_finished() {
            return Err(RegTruthError::validation(format!(
                "backfill run {run_id} is still {}",
                previous.status
            )));
        }

        let mut failed: Vec<String> = Vec::new();
        for err in &previous.errors {
            if !failed.contains(&err.source_id) {
                failed.push(err.source_id.clone());
            }
        }
        if previous.status == BackfillStatus::Cancelled && failed.is_empty() {
            failed = previous.params.sources.clone();
        }
        if failed.is_empty() {
            return Err(RegTruthError::validation(format!(
                "backfill run {run_id} has nothing to resume"
            )));
        }

        info!(run_id, sources = ?failed, "resuming backfill");
        self.run(BackfillParams {
            sources: failed,
            ..previous.params
        })
        .await
    }

    #[instrument(skip_all, fields(run_id = %run.id, dry_run = run.params.dry_run))]
    async fn execute(&self, run: BackfillRun) -> Result<BackfillReport> {
        let sources: Vec<SourceConfig> = run
            .params
            .sources
            .iter()
            .filter_map(|id| self.config.source(id).cloned())
            .collect();
        let delay = Duration::from_millis(run.params.delay_ms);
        let mut walker = ListingWalker::new(self.fetcher, delay);
        let mut tally = Tally {
            run,
            would_queue: 0,
            would_skip: 0,
            seen: HashSet::new(),
        };
        let mut cancelled = false;

        for source in &sources {
            if self.is_cancelled(&tally.run.id).await? {
                cancelled = true;
                break;
            }
            cancelled = self.run_source(source, &mut walker, &mut tally).await?;
            if !tally.run.params.dry_run {
                self.storage.update_backfill_run(&tally.run).await?;
            }
            if cancelled {
                break;
            }
        }

        let run = &mut tally.run;
        run.status = if cancelled {
            BackfillStatus::Cancelled
        } else if run.discovered_count == 0
            && !run.errors.is_empty()
            && sources
                .iter()
                .all(|s| run.errors.iter().any(|e| e.source_id == s.id))
        {
            BackfillStatus::Failed
        } else {
            BackfillStatus::Completed
        };
        run.finished_at = Some(Utc::now());
        self.storage.update_backfill_run(run).await?;

        // CANCELLED is sticky in storage even if cancellation raced the final write.
        if let Ok(status) = self.storage.backfill_run_status(&run.id).await {
            run.status = status;
        }

        info!(
            status = %run.status,
            discovered = run.discovered_count,
            queued = run.queued_count,
            skipped = run.skipped_count,
            errors = run.error_count,
            would_queue = tally.would_queue,
            "backfill finished"
        );
        Ok(BackfillReport {
            run: tally.run,
            would_queue: tally.would_queue,
            would_skip: tally.would_skip,
        })
    }

    /// Walk one source. Returns `true` if the run was cancelled meanwhile.
    #[instrument(skip_all, fields(source = %source.id))]
    async fn run_source(
        &self,
        source: &SourceConfig,
        walker: &mut ListingWalker<'_>,
        tally: &mut Tally,
    ) -> Result<bool> {
        let params = tally.run.params.clone();
        let targets = match backfill_targets(
            source,
            params.mode,
            params.date_from,
            params.date_to,
            Utc::now().date_naive(),
        ) {
            Ok(t) => t,
            Err(e) => {
                tally.error(&source.id, None, "config", e.to_string());
                return Ok(false);
            }
        };
        let pattern = match link_pattern(source) {
            Ok(p) => p,
            Err(e) => {
                tally.error(&source.id, None, "config", e.to_string());
                return Ok(false);
            }
        };

        let queue = DiscoveryQueue::backfill(self.storage, self.config, &tally.run.id);
        let mut pending: VecDeque<_> = targets.into();
        let mut per_source = 0;

        while let Some(target) = pending.pop_front() {
            if walker.reads() > 0 && self.is_cancelled(&tally.run.id).await? {
                return Ok(true);
            }

            let page = match walker.read(&target, pattern.as_ref()).await {
                Ok(page) => page,
                Err(e) => {
                    tally.error(&source.id, Some(target.url()), "listing", e.to_string());
                    continue;
                }
            };

            let mut fresh = 0;
            for entry in &page.entries {
                if !entry.within(params.date_from, params.date_to) {
                    continue;
                }
                let canonical = match canonicalize(&entry.url) {
                    Ok(c) => c,
                    Err(e) => {
                        tally.error(&source.id, Some(entry.url.clone()), "enqueue", e.to_string());
                        continue;
                    }
                };
                if !tally.seen.insert((source.id.clone(), canonical)) {
                    continue;
                }
                fresh += 1;
                tally.run.discovered_count += 1;

                if tally.at_cap(per_source) {
                    continue;
                }

                let outcome = if params.dry_run {
                    queue.is_known(source, &entry.url).await.map(|known| {
                        if known {
                            RegisterOutcome::Skipped
                        } else {
                            RegisterOutcome::Queued {
                                item_id: String::new(),
                            }
                        }
                    })
                } else {
                    queue.register(source, entry, target.crawl_depth()).await
                };

                match outcome {
                    Ok(RegisterOutcome::Queued { .. }) => {
                        tally.would_queue += 1;
                        per_source += 1;
                        if !params.dry_run {
                            tally.run.queued_count += 1;
                        }
                    }
                    Ok(RegisterOutcome::Skipped) => {
                        tally.would_skip += 1;
                        if !params.dry_run {
                            tally.run.skipped_count += 1;
                        }
                    }
                    Err(e) => {
                        tally.error(&source.id, Some(entry.url.clone()), "enqueue", e.to_string())
                    }
                }
            }

            // A page repeating only already-seen links ends the pagination.
            pending.extend(
                page.follow
                    .into_iter()
                    .filter(|next| !(target.is_page() && fresh == 0 && next.is_page())),
            );
        }
        Ok(false)
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        Ok(self.storage.backfill_run_status(run_id).await? == BackfillStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source, test_fetcher, test_storage};
    use chrono::NaiveDate;
    use regtruth_shared::{BackfillMode, ItemStatus, ListingKind};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn params(sources: &[&str], mode: BackfillMode, dry_run: bool) -> BackfillParams {
        BackfillParams {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            mode,
            date_from: None,
            date_to: None,
            max_urls: 1_000,
            max_urls_per_source: 1_000,
            delay_ms: 0,
            dry_run,
        }
    }

    fn urlset(urls: impl IntoIterator<Item = String>) -> String {
        let mut xml = String::from("<urlset>");
        for url in urls {
            xml.push_str(&format!("<url><loc>{url}</loc></url>"));
        }
        xml.push_str("</urlset>");
        xml
    }

    async fn sitemap_server(urls: Vec<String>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(urlset(urls)))
            .mount(&server)
            .await;
        server
    }

    fn config_for(server: &MockServer, id: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.sources = vec![source(
            id,
            ListingKind::Sitemap,
            &format!("{}/sitemap.xml", server.uri()),
        )];
        config
    }

    #[tokio::test]
    async fn kill_switch_blocks_real_runs_only() {
        let server = sitemap_server(vec!["https://gov.example/a".into()]).await;
        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let config = config_for(&server, "porezna");
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(false);

        let err = runner
            .run(params(&["porezna"], BackfillMode::Sitemap, false))
            .await
            .unwrap_err();
        assert!(matches!(err, RegTruthError::KillSwitch { .. }));
        assert!(err.to_string().contains("REGTRUTH_BACKFILL_ENABLED=true"));
        assert!(storage.list_backfill_runs(10).await.unwrap().is_empty());

        let report = runner
            .run(params(&["porezna"], BackfillMode::Sitemap, true))
            .await
            .unwrap();
        assert_eq!(report.run.status, BackfillStatus::Completed);
        assert_eq!(report.would_queue, 1);
    }

    #[tokio::test]
    async fn skips_known_urls_and_queues_new_ones() {
        let urls: Vec<String> = (1..=3).map(|i| format!("https://gov.example/d/{i}")).collect();
        let server = sitemap_server(urls.clone()).await;
        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let config = config_for(&server, "porezna");
        let src = config.source("porezna").unwrap();

        let scheduled = DiscoveryQueue::scheduled(&storage, &config);
        for url in &urls[..2] {
            let entry = crate::parser::ListingEntry {
                url: url.clone(),
                published: None,
                change_frequency: regtruth_shared::ChangeFrequency::Unknown,
            };
            scheduled.register(src, &entry, 0).await.unwrap();
        }

        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(true);
        let report = runner
            .run(params(&["porezna"], BackfillMode::Sitemap, false))
            .await
            .unwrap();
        let run = &report.run;
        assert_eq!(run.discovered_count, 3);
        assert_eq!(run.queued_count, 1);
        assert_eq!(run.skipped_count, 2);
        assert_eq!(storage.count_items_for_run(&run.id).await.unwrap(), 1);

        let stored = storage.get_backfill_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackfillStatus::Completed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn dry_run_counts_past_cap_and_persists_no_items() {
        let urls: Vec<String> = (0..360).map(|i| format!("https://gov.example/p/{i}")).collect();
        let server = sitemap_server(urls).await;
        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let config = config_for(&server, "porezna");
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(false);

        let mut p = params(&["porezna"], BackfillMode::Sitemap, true);
        p.max_urls = 50;
        let report = runner.run(p).await.unwrap();

        assert_eq!(report.run.discovered_count, 360);
        assert_eq!(report.run.queued_count, 0);
        assert_eq!(report.would_queue, 50);
        assert!(storage.count_items_by_status().await.unwrap().is_empty());

        let stored = storage.get_backfill_run(&report.run.id).await.unwrap().unwrap();
        assert_eq!(stored.discovered_count, 360);
        assert_eq!(stored.queued_count, 0);
    }

    #[tokio::test]
    async fn rerun_queues_nothing_and_skips_everything() {
        let urls: Vec<String> = (0..5).map(|i| format!("https://gov.example/r/{i}")).collect();
        let server = sitemap_server(urls).await;
        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let config = config_for(&server, "porezna");
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(true);

        let first = runner
            .run(params(&["porezna"], BackfillMode::Sitemap, false))
            .await
            .unwrap();
        assert_eq!(first.run.queued_count, 5);

        let second = runner
            .run(params(&["porezna"], BackfillMode::Sitemap, false))
            .await
            .unwrap();
        assert_eq!(second.run.queued_count, 0);
        assert_eq!(second.run.skipped_count, first.run.discovered_count);

        let counts = storage.count_items_by_status().await.unwrap();
        assert_eq!(counts, vec![(ItemStatus::Pending.as_str().to_string(), 5)]);
    }

    #[tokio::test]
    async fn per_source_cap_and_date_filter() {
        let server = MockServer::start().await;
        let xml = "<urlset>\
            <url><loc>https://gov.example/old</loc><lastmod>2019-05-01</lastmod></url>\
            <url><loc>https://gov.example/a</loc><lastmod>2024-05-01</lastmod></url>\
            <url><loc>https://gov.example/b</loc><lastmod>2024-06-01</lastmod></url>\
            <url><loc>https://gov.example/c</loc></url>\
            </urlset>";
        Mock::given(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(xml))
            .mount(&server)
            .await;

        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let config = config_for(&server, "porezna");
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(true);

        let mut p = params(&["porezna"], BackfillMode::Sitemap, false);
        p.date_from = NaiveDate::from_ymd_opt(2024, 1, 1);
        p.max_urls_per_source = 2;
        let report = runner.run(p).await.unwrap();

        assert_eq!(report.run.discovered_count, 3);
        assert_eq!(report.run.queued_count, 2);
        assert_eq!(report.run.skipped_count, 0);
    }

    #[tokio::test]
    async fn listing_failures_are_logged_and_resumable() {
        let good = sitemap_server(vec!["https://gov.example/ok".into()]).await;
        let bad = MockServer::start().await;
        Mock::given(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&bad)
            .await;

        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let mut config = AppConfig::default();
        config.sources = vec![
            source("good", ListingKind::Sitemap, &format!("{}/sitemap.xml", good.uri())),
            source("bad", ListingKind::Sitemap, &format!("{}/sitemap.xml", bad.uri())),
        ];
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(true);

        let report = runner
            .run(params(&["good", "bad"], BackfillMode::Sitemap, false))
            .await
            .unwrap();
        assert_eq!(report.run.status, BackfillStatus::Completed);
        assert_eq!(report.run.error_count, 1);
        let err = &report.run.errors[0];
        assert_eq!(err.source_id, "bad");
        assert_eq!(err.phase, "listing");
        assert!(err.url.as_deref().unwrap().ends_with("/sitemap.xml"));

        let resumed = runner.resume(&report.run.id).await.unwrap();
        assert_eq!(resumed.run.params.sources, vec!["bad".to_string()]);
        assert_eq!(resumed.run.status, BackfillStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_next_batch() {
        let server = MockServer::start().await;
        for page in 1..=3 {
            Mock::given(path(format!("/list/{page}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                    r#"<a href="/doc/{page}-a">a</a><a href="/doc/{page}-b">b</a>"#
                )))
                .mount(&server)
                .await;
        }

        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let mut config = AppConfig::default();
        let mut src = source("nn", ListingKind::Pagination, &format!("{}/list/1", server.uri()));
        src.pagination_template = Some(format!("{}/list/{{page}}", server.uri()));
        src.max_pages = 3;
        config.sources = vec![src];
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(true);

        let p = params(&["nn"], BackfillMode::Pagination, false);
        let full = runner.run(p.clone()).await.unwrap();
        assert_eq!(full.run.discovered_count, 6);

        // A run cancelled up front performs no listing reads.
        let run = BackfillRun {
            id: Uuid::now_v7().to_string(),
            params: p,
            status: BackfillStatus::Running,
            discovered_count: 0,
            queued_count: 0,
            skipped_count: 0,
            error_count: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        storage.insert_backfill_run(&run).await.unwrap();
        assert!(storage.cancel_backfill_run(&run.id).await.unwrap());
        let report = runner.execute(run).await.unwrap();
        assert_eq!(report.run.status, BackfillStatus::Cancelled);
        assert_eq!(report.run.discovered_count, 0);
    }

    #[tokio::test]
    async fn rejects_unknown_sources() {
        let storage = test_storage().await;
        let fetcher = test_fetcher();
        let config = AppConfig::default();
        let runner = BackfillRunner::new(&storage, &fetcher, &config).kill_switch(true);
        let err = runner
            .run(params(&["nope"], BackfillMode::Sitemap, false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown source"));
    }
}
