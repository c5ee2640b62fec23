//! Core domain model for jobhound: the canonical job record and source descriptors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobhound-core";

/// Category assigned when no configured keyword matches.
pub const DEFAULT_CATEGORY: &str = "General";

pub const MAX_DESCRIPTION_CHARS: usize = 10_000;
pub const MAX_TITLE_CHARS: usize = 500;

/// Length of the hex `job_id` derived for feed and API records.
pub const JOB_ID_HEX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rss,
    Api,
    Search,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rss => "rss",
            SourceType::Api => "api",
            SourceType::Search => "search",
        }
    }

    /// Feed and API records carry a content-derived id; search records carry the provider's.
    pub fn derives_job_id(&self) -> bool {
        !matches!(self, SourceType::Search)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical, source-independent job posting. One of these is one line in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub link: String,
    #[serde(default)]
    pub budget: Option<String>,
    #[serde(default)]
    pub proposals: Option<u32>,
    #[serde(default)]
    pub client_country: Option<String>,
    pub category: String,
    pub source: String,
    pub source_type: SourceType,
    pub created_at: DateTime<Utc>,
    pub crawled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

/// Scalar query parameter value as written in the source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

/// A configured origin of job postings. Read once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    /// Key of the array inside a JSON envelope object, e.g. `jobs` for `{"jobs": [...]}`.
    #[serde(default)]
    pub items_path: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl SourceDescriptor {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect()
    }
}
