//! Pure mapping from a per-source [`RawEntry`] onto the canonical [`JobRecord`].

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use jobhound_core::{JobRecord, SourceType, DEFAULT_CATEGORY};
use jobhound_storage::{job_id_for, LedgerView};
use regex::Regex;
use scraper::Html;
use serde_json::Value as JsonValue;
use tracing::debug;

static RE_BUDGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(\d+(?:,\d{3})*(?:\.\d{2})?)").expect("budget regex")
});
static RE_PROPOSALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(?:proposal|bid|applicant)").expect("proposals regex")
});
static RE_COUNTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:from|in|location)[:\s]+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)").expect("country regex")
});

/// Canonical intermediate shape every per-source adapter produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    /// Provider identifier; only the search source relies on it.
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub budget: Option<String>,
    pub proposals: Option<u32>,
    pub category: Option<String>,
    pub skills: Vec<String>,
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub source_name: &'a str,
    pub source_type: SourceType,
    pub keywords: &'a [String],
    pub captured_at: DateTime<Utc>,
    pub ledger: &'a LedgerView,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Map one entry to a record, or `None` when it lacks a title/link/id or is already known.
pub fn normalize(entry: RawEntry, ctx: &NormalizeContext<'_>) -> Option<JobRecord> {
    let Some(title) = non_empty(entry.title) else {
        debug!(source = ctx.source_name, "dropping entry without title");
        return None;
    };
    let Some(link) = non_empty(entry.link) else {
        debug!(source = ctx.source_name, %title, "dropping entry without link");
        return None;
    };

    let job_id = if ctx.source_type.derives_job_id() {
        job_id_for(ctx.source_name, &title, &link)
    } else {
        let Some(id) = non_empty(entry.external_id) else {
            debug!(source = ctx.source_name, %title, "dropping entry without provider id");
            return None;
        };
        id
    };

    if ctx.ledger.contains(&job_id) {
        debug!(source = ctx.source_name, %job_id, "skipping known job");
        return None;
    }

    let description = entry.description.unwrap_or_default();
    // Title is only scanned when there is no description at all.
    let scan = if description.trim().is_empty() { &title } else { &description };
    let budget = non_empty(entry.budget).or_else(|| parse_budget(scan));
    let proposals = entry.proposals.or_else(|| parse_proposals(scan));
    let client_country = non_empty(entry.location).or_else(|| extract_country(&description));
    let category = non_empty(entry.category)
        .unwrap_or_else(|| assign_category(&title, &description, ctx.keywords));

    Some(JobRecord {
        job_id,
        title,
        description,
        link,
        budget,
        proposals,
        client_country,
        category,
        source: ctx.source_name.to_string(),
        source_type: ctx.source_type,
        created_at: entry.published.unwrap_or(ctx.captured_at),
        crawled_at: ctx.captured_at,
        skills: entry.skills,
        keyword: entry.keyword,
    })
}

/// First `$`-prefixed amount, without the dollar sign. No currency conversion.
pub fn parse_budget(text: &str) -> Option<String> {
    RE_BUDGET
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn parse_proposals(text: &str) -> Option<u32> {
    RE_PROPOSALS
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Best-effort "from X" / "in X" / "Location: X" extraction of a capitalised place name.
pub fn extract_country(text: &str) -> Option<String> {
    RE_COUNTRY
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// First configured keyword found (case-insensitively) in the description or title.
pub fn assign_category(title: &str, description: &str, keywords: &[String]) -> String {
    let title = title.to_lowercase();
    let description = description.to_lowercase();
    keywords
        .iter()
        .find(|keyword| {
            let needle = keyword.trim().to_lowercase();
            !needle.is_empty() && (description.contains(&needle) || title.contains(&needle))
        })
        .cloned()
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
}

/// Collapse markup to whitespace-normalised text. Plain text passes through trimmed.
pub fn html_to_text(input: &str) -> String {
    if !input.contains('<') && !input.contains('&') {
        return input.trim().to_string();
    }
    let fragment = Html::parse_fragment(input);
    fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// RFC 3339, RFC 2822, a handful of naive layouts (taken as UTC), or epoch seconds.
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    raw.parse::<i64>().ok().and_then(epoch_to_datetime)
}

/// Values above 10^12 are taken as milliseconds.
fn epoch_to_datetime(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

pub fn parse_timestamp_value(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => parse_timestamp_str(s),
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(epoch_to_datetime),
        _ => None,
    }
}
