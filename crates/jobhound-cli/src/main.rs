use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobhound_adapters::SessionState;
use jobhound_sync::{recent_runs_markdown, CrawlConfig, RunSummary, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobhound-cli")]
#[command(about = "Multi-source job posting ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl cycle across every enabled source.
    Crawl,
    /// Crawl now, then keep crawling on a schedule until interrupted.
    Watch,
    /// Summarise the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Validate the captured browser session used by the search source.
    CheckSession {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn print_summary(summary: &RunSummary) {
    let total = summary.sources.len();
    for (i, source) in summary.sources.iter().enumerate() {
        match &source.failure {
            None => println!("[{}/{}] {}... ✓ {} jobs", i + 1, total, source.name, source.records),
            Some(failure) => println!("[{}/{}] {}... ✗ {}", i + 1, total, source.name, failure),
        }
    }
    println!(
        "crawl complete: run_id={} saved={} skipped={} sources_count={} failed_sources={}",
        summary.run_id,
        summary.saved,
        summary.skipped,
        summary.sources_count,
        summary.failed_sources.len()
    );
    if !summary.failed_sources.is_empty() {
        println!("failed: {}", summary.failed_sources.join(", "));
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports: {dir}");
    }
}

async fn check_session(path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => {
            let config = SyncConfig::from_env();
            CrawlConfig::load(&config.config_path)
                .await?
                .browser
                .cookies_path
        }
    };
    let session = SessionState::load(&path).await?;
    let expired = session.expired_count(Utc::now());
    println!(
        "session ok: {} cookies ({} expired) from {}",
        session.cookies.len(),
        expired,
        path.display()
    );
    for domain in session.domains() {
        println!("  - {domain}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jobhound=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Crawl) {
        Commands::Crawl => {
            let pipeline = SyncPipeline::from_env().await?;
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Watch => {
            let pipeline = Arc::new(SyncPipeline::from_env().await?);
            if let Some(summary) = pipeline.run_exclusive().await? {
                print_summary(&summary);
            }
            let mut sched = pipeline.build_watch_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!("watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", recent_runs_markdown(runs, &config.reports_dir)?);
        }
        Commands::CheckSession { path } => check_session(path).await?,
    }

    Ok(())
}
