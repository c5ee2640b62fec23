use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobhound_core::{JobRecord, SourceType};
use jobhound_storage::{FetchError, FetchRequest, HttpClientConfig, HttpFetcher, RetryPolicy};
use serde_json::Value as JsonValue;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::normalize::{normalize, NormalizeContext, RawEntry};
use crate::payload::{entry_from_search_item, search_buckets};
use crate::session::SessionState;
use crate::{AdapterError, FetchContext, SourceFetcher};

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub name: String,
    pub api_url: String,
    /// Sent as `Referer`; the search page a browser would be on.
    pub page_url: String,
    pub job_url_base: String,
    pub sort: String,
    pub keywords: Vec<String>,
    pub per_page: u32,
    pub max_pages: u32,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Wall-clock budget for the whole crawl. Pages still pending when it runs out are
    /// skipped and the records gathered so far are returned.
    pub crawl_budget: Option<Duration>,
}

impl SearchSettings {
    fn page_request(&self, keyword: &str, page: u32) -> FetchRequest {
        let per_page = self.per_page.max(1);
        FetchRequest::get(&self.api_url)
            .with_query([
                ("sort".to_string(), self.sort.clone()),
                ("paging".to_string(), format!("{};{}", page.saturating_mul(per_page), per_page)),
                ("per_page".to_string(), per_page.to_string()),
                ("q".to_string(), keyword.to_string()),
            ])
            .with_header("User-Agent", &self.user_agent)
            .with_header("Accept", "application/json, text/plain, */*")
            .with_header("Referer", &self.page_url)
            .retry_client_errors(true)
    }
}

/// Terminal state of one `(keyword, page)` request after the retry policy has run.
#[derive(Debug)]
pub enum PageState {
    Success(Vec<RawEntry>),
    Exhausted(FetchError),
}

/// Cookie-authenticated paginated search. Pages are fetched sequentially.
pub struct SearchFetcher {
    settings: SearchSettings,
    http: HttpFetcher,
}

impl SearchFetcher {
    pub fn new(settings: SearchSettings, session: &SessionState) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: settings.request_timeout,
            user_agent: Some(settings.user_agent.clone()),
            retry: settings.retry,
            cookie_jar: Some(session.cookie_jar()),
        })?;
        Ok(Self { settings, http })
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub async fn fetch_page(&self, keyword: &str, page: u32) -> PageState {
        let request = self.settings.page_request(keyword, page);
        let response = match self.http.fetch(&request).await {
            Ok(response) => response,
            Err(err) => return PageState::Exhausted(err),
        };

        let payload = match serde_json::from_slice::<JsonValue>(&response.body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(keyword, page, status = %response.status, %err, "search page is not JSON; session may have expired");
                return PageState::Success(Vec::new());
            }
        };
        let Some(items) = search_buckets(&payload) else {
            warn!(keyword, page, "search payload has no result list");
            return PageState::Success(Vec::new());
        };

        PageState::Success(
            items
                .iter()
                .filter_map(|item| entry_from_search_item(item, keyword, &self.settings.job_url_base))
                .collect(),
        )
    }

    async fn fetch_records(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError> {
        let deadline = self
            .settings
            .crawl_budget
            .and_then(|budget| Instant::now().checked_add(budget));
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut pages_ok = 0usize;
        let mut last_failure = None;
        let mut out_of_time = false;

        'crawl: for keyword in &self.settings.keywords {
            for page in 0..self.settings.max_pages {
                let state = match deadline {
                    Some(deadline) => match timeout_at(deadline, self.fetch_page(keyword, page)).await {
                        Ok(state) => state,
                        Err(_) => {
                            warn!(keyword = %keyword, page, "search budget spent; skipping remaining pages");
                            out_of_time = true;
                            break 'crawl;
                        }
                    },
                    None => self.fetch_page(keyword, page).await,
                };
                match state {
                    PageState::Success(entries) => {
                        pages_ok += 1;
                        let norm = NormalizeContext {
                            source_name: &self.settings.name,
                            source_type: SourceType::Search,
                            keywords: &ctx.keywords,
                            captured_at: Utc::now(),
                            ledger: &ctx.ledger,
                        };
                        let before = records.len();
                        for record in entries.into_iter().filter_map(|e| normalize(e, &norm)) {
                            if seen.insert(record.job_id.clone()) {
                                records.push(record);
                            }
                        }
                        debug!(keyword = %keyword, page, new = records.len() - before, "search page done");
                    }
                    PageState::Exhausted(err) => {
                        warn!(keyword = %keyword, page, error = %err, "search page exhausted; continuing");
                        last_failure = Some(err);
                    }
                }
            }
        }

        if pages_ok == 0 {
            if out_of_time {
                return Err(AdapterError::OutOfTime {
                    source_name: self.settings.name.clone(),
                    budget: self.settings.crawl_budget.unwrap_or_default(),
                });
            }
            if let Some(err) = last_failure {
                return Err(err.into());
            }
        }
        info!(records = records.len(), pages_ok, out_of_time, "search crawl finished");
        Ok(records)
    }
}

#[async_trait]
impl SourceFetcher for SearchFetcher {
    fn source_name(&self) -> &str {
        &self.settings.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Search
    }

    /// Every page that fails is logged and skipped, as are pages left when the crawl budget
    /// runs out. Only a crawl where no page succeeded is reported as a source failure.
    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError> {
        let span = info_span!(
            "source_fetch",
            source = %self.settings.name,
            source_type = "search",
            run_id = %ctx.run_id
        );
        self.fetch_records(ctx).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SearchSettings {
        SearchSettings {
            name: "Upwork".into(),
            api_url: "https://www.upwork.com/ab/jobs/search/url".into(),
            page_url: "https://www.upwork.com/nx/search/jobs/".into(),
            job_url_base: "https://www.upwork.com/jobs/".into(),
            sort: "recency".into(),
            keywords: vec!["rust".into()],
            per_page: 50,
            max_pages: 2,
            user_agent: "jobhound-test".into(),
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            crawl_budget: None,
        }
    }

    #[test]
    fn page_request_carries_paging_window_and_headers() {
        let req = settings().page_request("rust async", 2);
        assert_eq!(
            req.query,
            vec![
                ("sort".to_string(), "recency".to_string()),
                ("paging".to_string(), "100;50".to_string()),
                ("per_page".to_string(), "50".to_string()),
                ("q".to_string(), "rust async".to_string()),
            ]
        );
        assert!(req.retry_client_errors);
        assert!(req
            .headers
            .iter()
            .any(|(k, v)| k == "Referer" && v == "https://www.upwork.com/nx/search/jobs/"));
    }

    #[test]
    fn paging_offset_saturates_for_huge_windows() {
        let mut settings = settings();
        settings.per_page = u32::MAX;
        let req = settings.page_request("rust", 3);
        assert!(req
            .query
            .iter()
            .any(|(k, v)| k == "paging" && v == &format!("{};{}", u32::MAX, u32::MAX)));
    }
}
