use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::cookie::Jar;
use serde::Deserialize;
use url::Url;

use crate::AdapterError;

/// One cookie from a browser storage-state capture.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Epoch seconds; `-1` marks a session cookie.
    #[serde(default = "session_cookie_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn session_cookie_expiry() -> f64 {
    -1.0
}

impl SessionCookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires > 0.0 && self.expires < now.timestamp() as f64
    }

    fn host(&self) -> &str {
        self.domain.trim_start_matches('.')
    }

    fn header_value(&self) -> String {
        let mut value = format!("{}={}; Path={}", self.name, self.value, self.path);
        if self.domain.starts_with('.') {
            value.push_str(&format!("; Domain={}", self.host()));
        }
        if self.secure {
            value.push_str("; Secure");
        }
        if self.http_only {
            value.push_str("; HttpOnly");
        }
        value
    }

    fn origin_url(&self) -> Option<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{}{}", self.host(), self.path)).ok()
    }
}

/// Captured browser session (Playwright `storage_state` layout). Only cookies are used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub cookies: Vec<SessionCookie>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl SessionState {
    /// Load the capture, failing with an actionable message when it is absent or unreadable.
    pub async fn load(path: &Path) -> Result<Self, AdapterError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|err| {
            AdapterError::Session(format!(
                "cannot read session file {} ({err}); capture a logged-in browser session first",
                path.display()
            ))
        })?;
        let mut state: SessionState = serde_json::from_str(&text).map_err(|err| {
            AdapterError::Session(format!("session file {} is not valid storage state: {err}", path.display()))
        })?;
        if state.cookies.is_empty() {
            return Err(AdapterError::Session(format!(
                "session file {} contains no cookies",
                path.display()
            )));
        }
        state.path = path.to_path_buf();
        Ok(state)
    }

    pub fn domains(&self) -> BTreeSet<String> {
        self.cookies.iter().map(|c| c.host().to_string()).collect()
    }

    pub fn expired_count(&self, now: DateTime<Utc>) -> usize {
        self.cookies.iter().filter(|c| c.is_expired(now)).count()
    }

    /// Cookie jar holding every unexpired cookie, for the search client.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        let jar = Jar::default();
        let now = Utc::now();
        for cookie in self.cookies.iter().filter(|c| !c.is_expired(now)) {
            if let Some(url) = cookie.origin_url() {
                jar.add_cookie_str(&cookie.header_value(), &url);
            }
        }
        Arc::new(jar)
    }
}
