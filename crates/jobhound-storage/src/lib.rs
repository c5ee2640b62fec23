//! Record store, dedup ledger, and retrying HTTP fetch utilities for jobhound.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::cookie::Jar;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

mod ledger;
mod store;
mod validate;

pub use ledger::{job_id_for, Ledger, LedgerView};
pub use store::{JobStore, LedgerLoad, PersistReport};
pub use validate::{sanitize_record, truncate_chars, validate_record, ValidationError};

pub const CRATE_NAME: &str = "jobhound-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    RateLimited,
    ServerError,
    ClientError,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable(RetryReason),
    NonRetryable,
}

/// 429 and 5xx are always transient. Other 4xx are retried only when the caller asks for it.
pub fn classify_status(status: StatusCode, retry_client_errors: bool) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable(RetryReason::RateLimited)
    } else if status.is_server_error() {
        RetryDisposition::Retryable(RetryReason::ServerError)
    } else if status.is_client_error() && retry_client_errors {
        RetryDisposition::Retryable(RetryReason::ClientError)
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable(RetryReason::Transport)
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Shared backoff policy. `max_attempts` counts every request, including the first.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next request after `attempt` (1-based) failed.
    ///
    /// Rate limiting backs off linearly (`base * attempt`); every other transient
    /// failure waits a constant `base`. Both are capped by `max_delay`.
    pub fn delay_for(&self, attempt: usize, reason: RetryReason) -> Duration {
        let delay = match reason {
            RetryReason::RateLimited => {
                let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            RetryReason::ServerError | RetryReason::ClientError | RetryReason::Transport => {
                self.base_delay
            }
        };
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub cookie_jar: Option<Arc<Jar>>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            retry: RetryPolicy::default(),
            cookie_jar: None,
        }
    }
}

/// One GET request description. Cheap to clone so a retry loop can rebuild it.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub retry_client_errors: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn retry_client_errors(mut self, enabled: bool) -> Self {
        self.retry_client_errors = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("gave up on {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: usize,
        last_status: Option<u16>,
        last_error: String,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Exhausted { last_status, .. } => *last_status,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(jar) = config.cookie_jar {
            builder = builder.cookie_provider(jar);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Issue a GET, retrying transient failures per the retry policy.
    ///
    /// 2xx and 3xx responses are returned as-is; the body is not interpreted here.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %request.url);
        self.fetch_with_retry(request).instrument(span).await
    }

    async fn fetch_with_retry(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0usize;

        loop {
            attempt += 1;

            let mut builder = self.client.get(&request.url);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let (reason, last_status, last_error) = match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() || status.is_redirection() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            attempts: attempt,
                        });
                    }

                    match classify_status(status, request.retry_client_errors) {
                        RetryDisposition::Retryable(reason) => {
                            (reason, Some(status.as_u16()), format!("http status {status}"))
                        }
                        RetryDisposition::NonRetryable => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                    }
                }
                Err(err) => match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable(reason) => (reason, None, err.to_string()),
                    RetryDisposition::NonRetryable => return Err(FetchError::Request(err)),
                },
            };

            if attempt >= max_attempts {
                return Err(FetchError::Exhausted {
                    url: request.url.clone(),
                    attempts: attempt,
                    last_status,
                    last_error,
                });
            }

            let delay = self.retry.delay_for(attempt, reason);
            warn!(
                attempt,
                max_attempts,
                ?reason,
                delay_ms = delay.as_millis() as u64,
                "{last_error}; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_backoff_is_linear_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for(1, RetryReason::RateLimited), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, RetryReason::RateLimited), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, RetryReason::RateLimited), Duration::from_millis(300));
        assert_eq!(policy.delay_for(4, RetryReason::RateLimited), Duration::from_millis(350));
    }

    #[test]
    fn non_rate_limit_backoff_is_constant() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(20),
            max_delay: Duration::from_secs(60),
        };

        for attempt in 1..=3 {
            assert_eq!(policy.delay_for(attempt, RetryReason::ServerError), Duration::from_secs(20));
            assert_eq!(policy.delay_for(attempt, RetryReason::Transport), Duration::from_secs(20));
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false),
            RetryDisposition::Retryable(RetryReason::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, false),
            RetryDisposition::Retryable(RetryReason::ServerError)
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND, false), RetryDisposition::NonRetryable);
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, true),
            RetryDisposition::Retryable(RetryReason::ClientError)
        );
    }
}
