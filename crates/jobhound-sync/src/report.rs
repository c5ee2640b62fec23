use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::debug;

use crate::RunSummary;

const REPORT_JSON: &str = "crawl_report.json";
const REPORT_BRIEF: &str = "crawl_brief.md";

pub fn render_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Crawl Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at.to_rfc3339()),
        format!("- Finished: {}", summary.finished_at.to_rfc3339()),
        format!("- Sources: {}", summary.sources_count),
        format!("- New records fetched: {}", summary.fetched),
        format!("- Saved: {}", summary.saved),
        format!(
            "- Skipped: {} (duplicates {}, invalid {}, write failures {})",
            summary.skipped, summary.persist.duplicates, summary.persist.invalid, summary.persist.failed
        ),
        String::new(),
        "## Sources".to_string(),
        String::new(),
        "| Source | Type | Records | Time (ms) | Status |".to_string(),
        "|---|---|---|---|---|".to_string(),
    ];
    for source in &summary.sources {
        let status = match &source.failure {
            None => "ok".to_string(),
            Some(failure) => failure.to_string().replace('|', "\\|"),
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} |",
            source.name, source.source_type, source.records, source.elapsed_ms, status
        ));
    }
    if !summary.failed_sources.is_empty() {
        lines.push(String::new());
        lines.push(format!("Failed sources: {}", summary.failed_sources.join(", ")));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write `<reports_root>/<run_id>/crawl_report.json` and `crawl_brief.md`.
pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join(REPORT_JSON), json)
        .await
        .with_context(|| format!("writing {REPORT_JSON}"))?;
    fs::write(dir.join(REPORT_BRIEF), render_brief(summary))
        .await
        .with_context(|| format!("writing {REPORT_BRIEF}"))?;

    Ok(dir)
}

/// Most recent run summaries first. Directories without a readable report are ignored.
pub fn load_recent_reports(reports_root: &Path, runs: usize) -> Result<Vec<RunSummary>> {
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;

    let mut summaries = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(REPORT_JSON);
        if !path.is_file() {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<RunSummary>(&text).map_err(anyhow::Error::from));
        match parsed {
            Ok(summary) => summaries.push(summary),
            Err(err) => debug!(path = %path.display(), %err, "skipping unreadable run report"),
        }
    }

    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    summaries.truncate(runs.max(1));
    Ok(summaries)
}

pub fn recent_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let summaries = load_recent_reports(reports_root, runs)?;

    let mut lines = vec!["# Recent Crawl Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push(format!("No run reports under `{}`.", reports_root.display()));
    }
    for summary in summaries {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.to_rfc3339()));
        lines.push(format!(
            "- saved: {} / skipped: {} / sources: {}",
            summary.saved, summary.skipped, summary.sources_count
        ));
        if summary.failed_sources.is_empty() {
            lines.push("- failed sources: none".to_string());
        } else {
            lines.push(format!("- failed sources: {}", summary.failed_sources.join(", ")));
        }
        if let Some(dir) = &summary.reports_dir {
            lines.push(format!("- brief: `{}`", Path::new(dir).join(REPORT_BRIEF).display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
