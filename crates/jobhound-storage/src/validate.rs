use jobhound_core::{JobRecord, MAX_DESCRIPTION_CHARS, MAX_TITLE_CHARS};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("link is not an http(s) url: {0}")]
    InvalidLink(String),
    #[error("title too long ({0} chars, max 500)")]
    TitleTooLong(usize),
}

/// Cut `value` to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(value: &mut String, max_chars: usize) {
    if let Some((idx, _)) = value.char_indices().nth(max_chars) {
        value.truncate(idx);
    }
}

fn trim_in_place(value: &mut String) {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

/// Trim text fields and enforce length caps. Over-long text is truncated, never rejected.
pub fn sanitize_record(mut record: JobRecord) -> JobRecord {
    trim_in_place(&mut record.job_id);
    trim_in_place(&mut record.title);
    trim_in_place(&mut record.description);
    trim_in_place(&mut record.link);
    trim_in_place(&mut record.source);
    trim_in_place(&mut record.category);
    if let Some(country) = record.client_country.as_mut() {
        trim_in_place(country);
    }
    record.client_country = record.client_country.filter(|c| !c.is_empty());

    if record.source.is_empty() {
        record.source = "Unknown".to_string();
    }

    truncate_chars(&mut record.description, MAX_DESCRIPTION_CHARS);
    truncate_chars(&mut record.title, MAX_TITLE_CHARS);
    record
}

fn is_http_url(link: &str) -> bool {
    match Url::parse(link) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Check a record as it stands. [`JobStore::persist`](crate::JobStore::persist) sanitizes
/// first, so an over-long title only surfaces here for records validated unsanitized.
pub fn validate_record(record: &JobRecord) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if record.job_id.trim().is_empty() {
        errors.push(ValidationError::MissingField("job_id"));
    }
    if record.title.trim().is_empty() {
        errors.push(ValidationError::MissingField("title"));
    } else {
        let chars = record.title.chars().count();
        if chars > MAX_TITLE_CHARS {
            errors.push(ValidationError::TitleTooLong(chars));
        }
    }
    if record.link.trim().is_empty() {
        errors.push(ValidationError::MissingField("link"));
    } else if !is_http_url(&record.link) {
        errors.push(ValidationError::InvalidLink(record.link.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
