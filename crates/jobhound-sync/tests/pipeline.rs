use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use jobhound_core::JobRecord;
use jobhound_sync::{
    load_recent_reports, recent_runs_markdown, CrawlConfig, FailureKind, SyncConfig, SyncPipeline,
};
use tokio::net::TcpListener;

fn fixture(rel: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read_to_string(path).expect("fixture")
}

async fn feed() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/rss+xml")], fixture("feeds/remote_board.xml"))
}

async fn api() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], fixture("api/remote_jobs.json"))
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(30)).await;
    "<rss/>"
}

async fn search(Query(params): Query<HashMap<String, String>>) -> Response {
    if params.get("q").map(String::as_str) == Some("bad") {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    ([(header::CONTENT_TYPE, "application/json")], fixture("search/search_page.json")).into_response()
}

async fn serve() -> String {
    let app = Router::new()
        .route("/search", get(search))
        .route("/feed", get(feed))
        .route("/api", get(api))
        .route("/broken", get(broken))
        .route("/slow", get(slow));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn crawl_config(base: &str) -> CrawlConfig {
    let yaml = format!(
        r#"
sources:
  job_boards:
    - name: Remote Board
      url: {base}/feed
      enabled: true
    - name: Slow Feed
      url: {base}/slow
      enabled: true
      timeout_seconds: 1
  api_sources:
    - name: Example Jobs API
      url: {base}/api
      enabled: true
      items_path: jobs
    - name: Broken API
      url: {base}/broken
      enabled: true
  tech_blogs:
    - name: Disabled Blog
      url: {base}/feed
crawl:
  timeout_per_source: 5
  max_workers: 2
  deadline_slack_seconds: 2
search_keywords: [Rust, Python]
"#
    );
    CrawlConfig::from_yaml_str(&yaml).expect("crawl config")
}

#[tokio::test]
async fn run_isolates_failures_persists_and_reports() {
    let base = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let sync = SyncConfig {
        config_path: dir.path().join("config.yaml"),
        store_path: dir.path().join("data/raw_jobs.jsonl"),
        reports_dir: dir.path().join("reports"),
        sync_cron: None,
        in_ci: false,
    };
    let pipeline = SyncPipeline::new(sync.clone(), crawl_config(&base)).expect("pipeline");

    let first = pipeline.run_once().await.expect("first run");

    assert_eq!(first.sources_count, 4);
    let names = first.sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Remote Board", "Slow Feed", "Example Jobs API", "Broken API"]);
    assert_eq!(first.failed_sources, vec!["Slow Feed".to_string(), "Broken API".to_string()]);
    assert_eq!(
        first.sources[1].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Timeout)
    );
    assert_eq!(
        first.sources[3].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::StatusError)
    );
    assert_eq!(first.saved, 5);
    assert_eq!(first.skipped, 0);

    let stored = std::fs::read_to_string(&sync.store_path).expect("store");
    let records = stored
        .lines()
        .map(|line| serde_json::from_str::<JobRecord>(line).expect("record line"))
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 5);
    assert!(records.iter().any(|r| r.source == "Example Jobs API" && r.category == "Rust"));

    let second = pipeline.run_once().await.expect("second run");
    assert_eq!(second.saved, 0);
    assert_eq!(second.fetched, 0, "known ids are filtered before persistence");
    let stored = std::fs::read_to_string(&sync.store_path).expect("store");
    assert_eq!(stored.lines().count(), 5);

    let reports_dir = first.reports_dir.as_deref().expect("reports written");
    assert!(Path::new(reports_dir).join("crawl_report.json").is_file());
    assert!(Path::new(reports_dir).join("crawl_brief.md").is_file());

    let recent = load_recent_reports(&sync.reports_dir, 5).expect("recent reports");
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].run_id, second.run_id);
    let markdown = recent_runs_markdown(2, &sync.reports_dir).expect("markdown");
    assert!(markdown.contains(&first.run_id.to_string()));
}

#[tokio::test]
async fn rate_limited_keyword_keeps_records_from_the_other() {
    let base = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cookies = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/session/storage_state.json");
    let yaml = format!(
        r#"
browser:
  cookies_path: {cookies}
  retry_attempts: 3
  backoff_seconds: 1
search:
  enabled: true
  api_url: {base}/search
  keywords: [ok, bad]
  timeout_seconds: 2
"#,
        cookies = cookies.display()
    );
    let sync = SyncConfig {
        config_path: dir.path().join("config.yaml"),
        store_path: dir.path().join("raw_jobs.jsonl"),
        reports_dir: dir.path().join("reports"),
        sync_cron: None,
        in_ci: false,
    };
    let crawl = CrawlConfig::from_yaml_str(&yaml).expect("crawl config");
    let pipeline = SyncPipeline::new(sync, crawl).expect("pipeline");

    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.sources_count, 1);
    assert!(summary.failed_sources.is_empty(), "{:?}", summary.sources);
    assert_eq!(summary.sources[0].records, 2);
    assert_eq!(summary.saved, 2);
}

#[tokio::test]
async fn overlapping_runs_are_skipped() {
    let base = serve().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let sync = SyncConfig {
        config_path: dir.path().join("config.yaml"),
        store_path: dir.path().join("raw_jobs.jsonl"),
        reports_dir: dir.path().join("reports"),
        sync_cron: None,
        in_ci: false,
    };
    let pipeline = SyncPipeline::new(sync, crawl_config(&base)).expect("pipeline");

    let (a, b) = tokio::join!(pipeline.run_exclusive(), pipeline.run_exclusive());
    let ran = [a.expect("run a"), b.expect("run b")]
        .into_iter()
        .filter(Option::is_some)
        .count();
    assert_eq!(ran, 1);
}
