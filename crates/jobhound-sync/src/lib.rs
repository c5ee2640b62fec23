//! Crawl run orchestration: configuration, bounded scheduling, persistence, reports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobhound_adapters::{
    AdapterError, ApiFetcher, FeedFetcher, FetchContext, SearchFetcher, SearchSettings,
    SessionState, SourceFetcher, DEFAULT_USER_AGENT,
};
use jobhound_core::{JobRecord, SourceDescriptor, SourceType};
use jobhound_storage::{HttpClientConfig, HttpFetcher, JobStore, PersistReport, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod config;
mod report;
mod scheduler;

pub use config::{BrowserSettings, CrawlConfig, CrawlSettings, SearchSection, SourcesSection};
pub use report::{load_recent_reports, recent_runs_markdown, render_brief, write_reports};
pub use scheduler::{
    run_bounded, FailureKind, ScheduledTask, SchedulerConfig, SourceFailure, TaskOutcome,
};

pub const CRATE_NAME: &str = "jobhound-sync";

/// Upper bound on a single search page request; the search crawl budget bounds the whole crawl.
const SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the search task gets past its crawl budget to hand back partial results.
const SEARCH_RETURN_GRACE: Duration = Duration::from_secs(2);

/// Process-level settings, taken from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub store_path: PathBuf,
    pub reports_dir: PathBuf,
    pub sync_cron: Option<String>,
    pub in_ci: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("JOBHOUND_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/config.yaml")),
            store_path: std::env::var("JOBHOUND_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/raw_jobs.jsonl")),
            reports_dir: std::env::var("JOBHOUND_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            sync_cron: std::env::var("JOBHOUND_SYNC_CRON")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            in_ci: env_flag("CI") || env_flag("GITHUB_ACTIONS"),
        }
    }
}

impl From<AdapterError> for SourceFailure {
    fn from(err: AdapterError) -> Self {
        let kind = match &err {
            AdapterError::Fetch(fetch) if fetch.is_timeout() => FailureKind::Timeout,
            AdapterError::Fetch(fetch) if fetch.status().is_some() => FailureKind::StatusError,
            AdapterError::Fetch(_) => FailureKind::TransportError,
            AdapterError::Parse { .. } => FailureKind::ParseError,
            AdapterError::Session(_) => FailureKind::ConfigError,
            AdapterError::OutOfTime { .. } => FailureKind::Timeout,
            AdapterError::Anyhow(_) => FailureKind::TaskFailed,
        };
        SourceFailure::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub name: String,
    pub source_type: SourceType,
    /// New (not previously ingested) records the source produced.
    pub records: usize,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub failure: Option<SourceFailure>,
}

impl SourceOutcome {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_count: usize,
    pub fetched: usize,
    pub saved: usize,
    pub skipped: usize,
    pub persist: PersistReport,
    pub failed_sources: Vec<String>,
    pub sources: Vec<SourceOutcome>,
    #[serde(default)]
    pub reports_dir: Option<String>,
}

/// One enabled source, ready to be scheduled.
pub struct PlannedSource {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub timeout: Option<Duration>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    crawl: CrawlConfig,
    http: Arc<HttpFetcher>,
    store: JobStore,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, crawl: CrawlConfig) -> Result<Self> {
        crawl.validate()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: crawl.crawl.task_timeout(),
            user_agent: Some(
                crawl
                    .crawl
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ),
            ..Default::default()
        })?;
        let store = JobStore::new(config.store_path.clone());
        Ok(Self {
            config,
            crawl,
            http: Arc::new(http),
            store,
            run_lock: Mutex::new(()),
        })
    }

    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let crawl = CrawlConfig::load(&config.config_path).await?;
        Self::new(config, crawl)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn crawl_config(&self) -> &CrawlConfig {
        &self.crawl
    }

    fn search_settings(&self) -> SearchSettings {
        let search = &self.crawl.search;
        let browser = &self.crawl.browser;
        let backoff = Duration::from_secs(browser.backoff_seconds);
        let attempts = browser.retry_attempts.max(1);
        SearchSettings {
            name: search.name.clone(),
            api_url: search.api_url.clone(),
            page_url: search.page_url.clone(),
            job_url_base: search.job_url_base.clone(),
            sort: search.sort.clone(),
            keywords: search.keywords.clone(),
            per_page: search.per_page,
            max_pages: search.max_pages,
            user_agent: browser.user_agent.clone(),
            request_timeout: SEARCH_REQUEST_TIMEOUT.min(Duration::from_secs(search.timeout_seconds.max(1))),
            retry: RetryPolicy {
                max_attempts: attempts,
                base_delay: backoff,
                max_delay: backoff.saturating_mul(u32::try_from(attempts).unwrap_or(u32::MAX)),
            },
            crawl_budget: Some(search.crawl_budget()),
        }
    }

    /// Enumerate enabled sources in configuration order: job boards, APIs, tech blogs, search.
    ///
    /// Fails before any fetch when search is enabled and the session file is unusable.
    pub async fn plan_sources(&self) -> Result<Vec<PlannedSource>> {
        let sources = &self.crawl.sources;
        let skip_blogs = self.config.in_ci && self.crawl.crawl.skip_tech_blogs_in_ci;
        if skip_blogs && sources.tech_blogs.iter().any(|s| s.enabled) {
            info!("running in CI; skipping tech blog feeds");
        }

        let timeout_of = |source: &SourceDescriptor| source.timeout_seconds.map(Duration::from_secs);
        let mut planned = Vec::new();
        for source in sources.job_boards.iter().filter(|s| s.enabled) {
            planned.push(PlannedSource {
                timeout: timeout_of(source),
                fetcher: Arc::new(FeedFetcher::new(source.clone(), Arc::clone(&self.http))),
            });
        }
        for source in sources.api_sources.iter().filter(|s| s.enabled) {
            planned.push(PlannedSource {
                timeout: timeout_of(source),
                fetcher: Arc::new(ApiFetcher::new(source.clone(), Arc::clone(&self.http))),
            });
        }
        if !skip_blogs {
            for source in sources.tech_blogs.iter().filter(|s| s.enabled) {
                planned.push(PlannedSource {
                    timeout: timeout_of(source),
                    fetcher: Arc::new(FeedFetcher::new(source.clone(), Arc::clone(&self.http))),
                });
            }
        }

        if self.crawl.search.enabled {
            let session = SessionState::load(&self.crawl.browser.cookies_path).await?;
            let fetcher = SearchFetcher::new(self.search_settings(), &session)
                .context("building search client")?;
            planned.push(PlannedSource {
                timeout: Some(self.crawl.search.crawl_budget().saturating_add(SEARCH_RETURN_GRACE)),
                fetcher: Arc::new(fetcher),
            });
        }

        Ok(planned)
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_workers: self.crawl.crawl.max_workers,
            task_timeout: self.crawl.crawl.task_timeout(),
            deadline_slack: self.crawl.crawl.deadline_slack(),
            deadline: None,
        }
    }

    /// One full cycle: plan, fetch in parallel, persist, report.
    ///
    /// Source failures are recorded in the summary; only setup problems are errors.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let planned = self.plan_sources().await?;
        let load = self.store.load_ledger().await?;
        let mut ledger = load.ledger;
        info!(
            %run_id,
            sources = planned.len(),
            known_jobs = ledger.len(),
            "starting crawl run"
        );

        let ctx = Arc::new(FetchContext::new(
            run_id,
            self.crawl.search_keywords.clone(),
            ledger.view(),
        ));
        let kinds = planned
            .iter()
            .map(|p| p.fetcher.source_type())
            .collect::<Vec<_>>();
        let tasks = planned
            .into_iter()
            .map(|source| {
                let ctx = Arc::clone(&ctx);
                let fetcher = Arc::clone(&source.fetcher);
                ScheduledTask::new(source.fetcher.source_name(), async move {
                    fetcher.fetch(&ctx).await.map_err(SourceFailure::from)
                })
                .with_timeout(source.timeout)
            })
            .collect::<Vec<_>>();

        let outcomes = run_bounded(tasks, self.scheduler_config()).await;

        let mut records: Vec<JobRecord> = Vec::new();
        let mut sources = Vec::with_capacity(outcomes.len());
        for (outcome, source_type) in outcomes.into_iter().zip(kinds) {
            let elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
            match outcome.result {
                Ok(batch) => {
                    sources.push(SourceOutcome {
                        name: outcome.name,
                        source_type,
                        records: batch.len(),
                        elapsed_ms,
                        failure: None,
                    });
                    records.extend(batch);
                }
                Err(failure) => {
                    warn!(source = %outcome.name, kind = %failure.kind, detail = %failure.detail, "source failed");
                    sources.push(SourceOutcome {
                        name: outcome.name,
                        source_type,
                        records: 0,
                        elapsed_ms,
                        failure: Some(failure),
                    });
                }
            }
        }

        let fetched = records.len();
        let persist = self.store.persist(records, &mut ledger).await;
        let failed_sources = sources
            .iter()
            .filter(|s| !s.is_ok())
            .map(|s| s.name.clone())
            .collect::<Vec<_>>();

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources_count: sources.len(),
            fetched,
            saved: persist.saved,
            skipped: persist.skipped(),
            persist,
            failed_sources,
            sources,
            reports_dir: None,
        };

        match write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => error!(error = %format!("{err:#}"), "failed to write run reports"),
        }

        info!(
            %run_id,
            saved = summary.saved,
            skipped = summary.skipped,
            failed = summary.failed_sources.len(),
            "crawl run finished"
        );
        Ok(summary)
    }

    /// Run a cycle unless one is already in progress, in which case `None` is returned.
    pub async fn run_exclusive(&self) -> Result<Option<RunSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous crawl run still in progress; skipping this tick");
            return Ok(None);
        };
        self.run_once().await.map(Some)
    }

    /// Scheduler that repeats [`Self::run_exclusive`] on `JOBHOUND_SYNC_CRON`, or every
    /// `search.interval_seconds` when no cron expression is configured.
    pub async fn build_watch_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let job = match &self.config.sync_cron {
            Some(cron) => {
                let pipeline = Arc::clone(self);
                Job::new_async(cron.as_str(), move |_uuid, _l| {
                    let pipeline = Arc::clone(&pipeline);
                    Box::pin(async move { pipeline.watch_tick().await })
                })
                .with_context(|| format!("creating scheduler job for cron {cron}"))?
            }
            None => {
                let period = Duration::from_secs(self.crawl.search.interval_seconds.max(1));
                let pipeline = Arc::clone(self);
                Job::new_repeated_async(period, move |_uuid, _l| {
                    let pipeline = Arc::clone(&pipeline);
                    Box::pin(async move { pipeline.watch_tick().await })
                })
                .with_context(|| format!("creating scheduler job every {}s", period.as_secs()))?
            }
        };
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    async fn watch_tick(&self) {
        match self.run_exclusive().await {
            Ok(Some(summary)) => info!(
                run_id = %summary.run_id,
                saved = summary.saved,
                failed = summary.failed_sources.len(),
                "watch cycle complete"
            ),
            Ok(None) => {}
            Err(err) => error!(error = %format!("{err:#}"), "watch cycle failed"),
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    SyncPipeline::from_env().await?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhound_storage::FetchError;

    fn sync_config(dir: &std::path::Path) -> SyncConfig {
        SyncConfig {
            config_path: dir.join("config.yaml"),
            store_path: dir.join("raw_jobs.jsonl"),
            reports_dir: dir.join("reports"),
            sync_cron: None,
            in_ci: false,
        }
    }

    #[test]
    fn adapter_errors_map_to_failure_kinds() {
        let status: SourceFailure = AdapterError::Fetch(FetchError::HttpStatus {
            status: 404,
            url: "https://example.com/feed".into(),
        })
        .into();
        assert_eq!(status.kind, FailureKind::StatusError);

        let exhausted: SourceFailure = AdapterError::Fetch(FetchError::Exhausted {
            url: "https://example.com".into(),
            attempts: 3,
            last_status: None,
            last_error: "connection refused".into(),
        })
        .into();
        assert_eq!(exhausted.kind, FailureKind::TransportError);

        let parse: SourceFailure = AdapterError::parse("Board", "bad xml").into();
        assert_eq!(parse.kind, FailureKind::ParseError);

        let session: SourceFailure = AdapterError::Session("missing".into()).into();
        assert_eq!(session.kind, FailureKind::ConfigError);

        let out_of_time: SourceFailure = AdapterError::OutOfTime {
            source_name: "Upwork".into(),
            budget: Duration::from_secs(120),
        }
        .into();
        assert_eq!(out_of_time.kind, FailureKind::Timeout);
        assert_eq!(out_of_time.detail, "Upwork: no page completed within 120s");
    }

    #[tokio::test]
    async fn tech_blogs_are_skipped_in_ci() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
sources:
  job_boards:
    - { name: Board, url: "https://example.com/jobs.rss", enabled: true }
    - { name: Disabled, url: "https://example.com/off.rss" }
  api_sources:
    - { name: Api, url: "https://example.com/api", enabled: true, timeout_seconds: 9 }
  tech_blogs:
    - { name: Blog, url: "https://example.com/blog.rss", enabled: true }
"#;
        let crawl = CrawlConfig::from_yaml_str(yaml).unwrap();

        let local = SyncPipeline::new(sync_config(dir.path()), crawl.clone()).unwrap();
        let names = local
            .plan_sources()
            .await
            .unwrap()
            .iter()
            .map(|p| p.fetcher.source_name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Board", "Api", "Blog"]);

        let mut ci = sync_config(dir.path());
        ci.in_ci = true;
        let planned = SyncPipeline::new(ci, crawl).unwrap().plan_sources().await.unwrap();
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[1].timeout, Some(Duration::from_secs(9)));
        assert_eq!(planned[1].fetcher.source_type(), SourceType::Api);
    }

    #[tokio::test]
    async fn enabled_search_without_session_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "browser:\n  cookies_path: {}\nsearch:\n  enabled: true\n  keywords: [rust]\n",
            dir.path().join("missing.json").display()
        );
        let crawl = CrawlConfig::from_yaml_str(&yaml).unwrap();
        let pipeline = SyncPipeline::new(sync_config(dir.path()), crawl).unwrap();
        let err = pipeline.plan_sources().await.err().expect("missing session must fail");
        assert!(format!("{err:#}").contains("session"));
    }

    #[test]
    fn search_retry_policy_follows_browser_settings() {
        let dir = tempfile::tempdir().unwrap();
        let crawl = CrawlConfig::from_yaml_str(
            "browser:\n  retry_attempts: 4\n  backoff_seconds: 2\nsearch:\n  timeout_seconds: 10\n",
        )
        .unwrap();
        let settings = SyncPipeline::new(sync_config(dir.path()), crawl)
            .unwrap()
            .search_settings();
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.base_delay, Duration::from_secs(2));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(8));
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.crawl_budget, Some(Duration::from_secs(10)));
    }
}
