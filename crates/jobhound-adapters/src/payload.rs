//! Per-source-type adapters: each maps one provider payload shape onto [`RawEntry`].

use feed_rs::model::Entry as FeedEntry;
use serde_json::{Map, Value as JsonValue};

use crate::normalize::{html_to_text, parse_timestamp_value, RawEntry};

type JsonObject = Map<String, JsonValue>;

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Render a scalar as text. Empty strings, null, bools and containers yield `None`.
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 {
                        format!("{}", f as i64)
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        _ => None,
    }
}

fn first_text(item: &JsonObject, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| item.get(*key).and_then(scalar_text))
}

fn first_value<'a>(item: &'a JsonObject, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| item.get(*key))
        .find(|v| !v.is_null())
}

fn text_or_markup(value: String) -> String {
    html_to_text(&value)
}

// ---------------------------------------------------------------------------
// Feeds
// ---------------------------------------------------------------------------

pub fn entry_from_feed(entry: &FeedEntry) -> RawEntry {
    let link = entry
        .links
        .first()
        .map(|l| l.href.clone())
        .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()));
    let description = entry
        .summary
        .as_ref()
        .map(|t| t.content.as_str())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.as_deref()))
        .map(html_to_text);

    RawEntry {
        title: entry.title.as_ref().map(|t| html_to_text(&t.content)),
        link,
        description,
        published: entry.published.or(entry.updated),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// JSON APIs
// ---------------------------------------------------------------------------

/// Locate the item list in an API body.
///
/// `items_path` (dot separated) descends into an envelope first. A single object is
/// treated as a one-element list and non-object array elements are discarded.
pub fn api_items<'a>(
    body: &'a JsonValue,
    items_path: Option<&str>,
) -> Result<Vec<&'a JsonObject>, String> {
    let root = match items_path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => {
            let segments = path.split('.').collect::<Vec<_>>();
            json_path(body, &segments).ok_or_else(|| format!("no `{path}` key in response"))?
        }
        None => body,
    };

    match root {
        JsonValue::Array(items) => Ok(items.iter().filter_map(JsonValue::as_object).collect()),
        JsonValue::Object(obj) => Ok(vec![obj]),
        other => Err(format!(
            "expected a JSON object or array, got {}",
            json_kind(other)
        )),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

pub fn entry_from_api_item(item: &JsonObject) -> RawEntry {
    RawEntry {
        title: first_text(item, &["title", "name", "position"]),
        link: first_text(item, &["url", "link", "apply_url"]),
        description: first_text(item, &["description", "summary", "content"]).map(text_or_markup),
        location: first_text(item, &["location", "candidate_required_location"]),
        published: first_value(item, &["created_at", "date", "publication_date", "published"])
            .and_then(parse_timestamp_value),
        budget: first_text(item, &["budget", "salary"]),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Authenticated search
// ---------------------------------------------------------------------------

/// The result list lives under `results`, `jobs`, or `searchResults.jobs.results`.
pub fn search_buckets(payload: &JsonValue) -> Option<&Vec<JsonValue>> {
    payload
        .get("results")
        .and_then(JsonValue::as_array)
        .or_else(|| payload.get("jobs").and_then(JsonValue::as_array))
        .or_else(|| {
            json_path(payload, &["searchResults", "jobs", "results"]).and_then(JsonValue::as_array)
        })
}

fn skill_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::Object(obj) => first_text(obj, &["name", "prettyName", "skill"]),
                other => scalar_text(other),
            })
            .collect(),
        Some(other) => scalar_text(other).into_iter().collect(),
        None => Vec::new(),
    }
}

fn positive_amount(value: &JsonValue) -> Option<String> {
    let text = scalar_text(value)?;
    match text.parse::<f64>() {
        Ok(amount) if amount <= 0.0 => None,
        _ => Some(text),
    }
}

fn hourly_range(min: Option<String>, max: Option<String>) -> Option<String> {
    match (min, max) {
        (Some(min), Some(max)) if min != max => Some(format!("{min}-{max}/hr")),
        (Some(rate), _) | (None, Some(rate)) => Some(format!("{rate}/hr")),
        (None, None) => None,
    }
}

/// Fixed budgets render as the amount, hourly ranges as `min-max/hr`.
fn search_budget(item: &JsonObject) -> Option<String> {
    match first_value(item, &["budget", "amount"]) {
        Some(JsonValue::Object(budget)) => {
            if let Some(amount) = first_value(budget, &["budget", "amount"]).and_then(positive_amount) {
                return Some(amount);
            }
        }
        Some(other) => {
            if let Some(amount) = positive_amount(other) {
                return Some(amount);
            }
        }
        None => {}
    }

    if let Some(JsonValue::Object(hourly)) = item.get("hourly") {
        let min = first_value(hourly, &["min_rate", "min"]).and_then(positive_amount);
        let max = first_value(hourly, &["max_rate", "max"]).and_then(positive_amount);
        if let Some(range) = hourly_range(min, max) {
            return Some(range);
        }
    }

    hourly_range(
        item.get("hourly_rate_min").and_then(positive_amount),
        item.get("hourly_rate_max").and_then(positive_amount),
    )
}

fn client_country(item: &JsonObject) -> Option<String> {
    let client = item.get("client")?.as_object()?;
    let location = match client.get("location") {
        Some(JsonValue::Object(location)) => first_text(location, &["country", "name"]),
        Some(other) => scalar_text(other),
        None => None,
    };
    location.or_else(|| first_text(client, &["country"]))
}

/// Accepts a number, or a string such as `"5 to 10"` (leading digits win).
fn proposal_count(item: &JsonObject) -> Option<u32> {
    match first_value(item, &["proposals", "num_proposals"])? {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => {
            let digits = s
                .trim()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Items without any provider id are skipped. Missing links fall back to `job_url_base + id`.
pub fn entry_from_search_item(item: &JsonValue, keyword: &str, job_url_base: &str) -> Option<RawEntry> {
    let item = item.as_object()?;
    let id = first_text(item, &["ciphertext", "job_id", "id", "oid"])?;
    let link = first_text(item, &["url", "link"]).or_else(|| {
        let base = job_url_base.trim();
        (!base.is_empty()).then(|| format!("{base}{id}"))
    });

    Some(RawEntry {
        title: first_text(item, &["title"]),
        link,
        description: first_text(item, &["snippet", "description"]).map(text_or_markup),
        location: client_country(item),
        published: first_value(
            item,
            &["publish_time", "published_time", "created_on", "date_created", "posted_on"],
        )
        .and_then(parse_timestamp_value),
        budget: search_budget(item),
        proposals: proposal_count(item),
        category: first_text(item, &["category2", "subcategory2", "category"]),
        skills: skill_list(item.get("skills")),
        keyword: Some(keyword.to_string()),
        external_id: Some(id),
    })
}
