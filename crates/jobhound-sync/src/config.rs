use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jobhound_core::SourceDescriptor;
use serde::Deserialize;
use tokio::fs;

/// Source configuration file (`config/config.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlConfig {
    #[serde(default)]
    pub sources: SourcesSection,
    #[serde(default)]
    pub crawl: CrawlSettings,
    /// Category keywords in priority order.
    #[serde(default)]
    pub search_keywords: Vec<String>,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub search: SearchSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesSection {
    #[serde(default, alias = "rss_feeds")]
    pub job_boards: Vec<SourceDescriptor>,
    #[serde(default)]
    pub api_sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub tech_blogs: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrawlSettings {
    #[serde(default = "default_timeout_per_source")]
    pub timeout_per_source: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub skip_tech_blogs_in_ci: bool,
    #[serde(default = "default_deadline_slack")]
    pub deadline_slack_seconds: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            timeout_per_source: default_timeout_per_source(),
            max_workers: default_max_workers(),
            skip_tech_blogs_in_ci: true,
            deadline_slack_seconds: default_deadline_slack(),
            user_agent: None,
        }
    }
}

impl CrawlSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_per_source)
    }

    pub fn deadline_slack(&self) -> Duration {
        Duration::from_secs(self.deadline_slack_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSettings {
    #[serde(default = "default_cookies_path")]
    pub cookies_path: PathBuf,
    #[serde(default = "default_browser_user_agent")]
    pub user_agent: String,
    /// Total attempts per search page, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            cookies_path: default_cookies_path(),
            user_agent: default_browser_user_agent(),
            retry_attempts: default_retry_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_search_name")]
    pub name: String,
    #[serde(default = "default_search_api_url")]
    pub api_url: String,
    #[serde(default = "default_search_page_url")]
    pub page_url: String,
    #[serde(default = "default_job_url_base")]
    pub job_url_base: String,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_search_timeout")]
    pub timeout_seconds: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_search_name(),
            api_url: default_search_api_url(),
            page_url: default_search_page_url(),
            job_url_base: default_job_url_base(),
            sort: default_sort(),
            keywords: Vec::new(),
            per_page: default_per_page(),
            max_pages: default_max_pages(),
            interval_seconds: default_interval_seconds(),
            timeout_seconds: default_search_timeout(),
        }
    }
}

impl SearchSection {
    pub fn crawl_budget(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

fn default_timeout_per_source() -> u64 {
    5
}
fn default_max_workers() -> usize {
    8
}
fn default_true() -> bool {
    true
}
fn default_deadline_slack() -> u64 {
    5
}
fn default_cookies_path() -> PathBuf {
    PathBuf::from("config/storage_state.json")
}
fn default_browser_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
        .to_string()
}
fn default_retry_attempts() -> usize {
    3
}
fn default_backoff_seconds() -> u64 {
    20
}
fn default_search_name() -> String {
    "Upwork".to_string()
}
fn default_search_api_url() -> String {
    "https://www.upwork.com/ab/jobs/search/api".to_string()
}
fn default_search_page_url() -> String {
    "https://www.upwork.com/nx/search/jobs/".to_string()
}
fn default_job_url_base() -> String {
    "https://www.upwork.com/jobs/".to_string()
}
fn default_sort() -> String {
    "recency".to_string()
}
fn default_per_page() -> u32 {
    50
}
fn default_max_pages() -> u32 {
    1
}
fn default_interval_seconds() -> u64 {
    45
}
fn default_search_timeout() -> u64 {
    120
}

impl CrawlConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: CrawlConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless before anything is fetched.
    pub fn validate(&self) -> Result<()> {
        if self.crawl.max_workers == 0 {
            bail!("crawl.max_workers must be at least 1");
        }
        if self.crawl.timeout_per_source == 0 {
            bail!("crawl.timeout_per_source must be at least 1 second");
        }
        let all_sources = self
            .sources
            .job_boards
            .iter()
            .chain(&self.sources.api_sources)
            .chain(&self.sources.tech_blogs);
        for source in all_sources {
            if source.enabled && source.url.trim().is_empty() {
                bail!("source `{}` is enabled but has no url", source.name);
            }
        }
        if self.search.enabled {
            if self.search.api_url.trim().is_empty() {
                bail!("search.api_url is required when search is enabled");
            }
            if self.search.keywords.is_empty() {
                bail!("search.keywords must list at least one query when search is enabled");
            }
            if self.search.per_page == 0 {
                bail!("search.per_page must be at least 1");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_a_minimal_file() {
        let config = CrawlConfig::from_yaml_str("sources: {}\n").unwrap();
        assert_eq!(config.crawl.timeout_per_source, 5);
        assert_eq!(config.crawl.max_workers, 8);
        assert!(config.crawl.skip_tech_blogs_in_ci);
        assert_eq!(config.browser.retry_attempts, 3);
        assert_eq!(config.browser.backoff_seconds, 20);
        assert_eq!(config.search.per_page, 50);
        assert_eq!(config.search.max_pages, 1);
        assert_eq!(config.search.interval_seconds, 45);
        assert!(!config.search.enabled);
    }

    #[test]
    fn sample_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/config.yaml");
        let text = std::fs::read_to_string(path).expect("sample config");
        let config = CrawlConfig::from_yaml_str(&text).expect("valid sample");
        assert!(!config.sources.job_boards.is_empty());
        assert!(config.sources.api_sources.iter().any(|s| s.items_path.is_some()));
        assert!(!config.search_keywords.is_empty());
    }

    #[test]
    fn legacy_rss_feeds_key_is_accepted() {
        let yaml = "sources:\n  rss_feeds:\n    - name: Board\n      url: https://example.com/feed\n      enabled: true\n";
        let config = CrawlConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.sources.job_boards.len(), 1);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(CrawlConfig::from_yaml_str("crawl:\n  max_workers: 0\n").is_err());
        assert!(CrawlConfig::from_yaml_str("search:\n  enabled: true\n").is_err());
        assert!(CrawlConfig::from_yaml_str(
            "sources:\n  api_sources:\n    - name: Empty\n      url: ''\n      enabled: true\n"
        )
        .is_err());
        assert!(CrawlConfig::from_yaml_str("sources: [not, a, mapping]\n").is_err());
    }
}
