use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jobhound_core::{JobRecord, SourceDescriptor, SourceType};
use jobhound_storage::{FetchRequest, HttpFetcher};
use tracing::{debug, info, info_span, Instrument};

use crate::normalize::{normalize, NormalizeContext};
use crate::payload::entry_from_feed;
use crate::{AdapterError, FetchContext, SourceFetcher};

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

/// RSS/Atom source. An empty feed is a success with zero records.
pub struct FeedFetcher {
    source: SourceDescriptor,
    http: Arc<HttpFetcher>,
}

impl FeedFetcher {
    pub fn new(source: SourceDescriptor, http: Arc<HttpFetcher>) -> Self {
        Self { source, http }
    }

    async fn fetch_records(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError> {
        let request = FetchRequest::get(&self.source.url)
            .with_query(self.source.query_pairs())
            .with_header("Accept", FEED_ACCEPT);
        let response = self.http.fetch(&request).await?;
        let captured_at = Utc::now();

        if response.body.iter().all(u8::is_ascii_whitespace) {
            info!(status = %response.status, "feed returned an empty body");
            return Ok(Vec::new());
        }

        let feed = feed_rs::parser::parse(&response.body[..])
            .map_err(|err| AdapterError::parse(&self.source.name, err.to_string()))?;

        let norm = NormalizeContext {
            source_name: &self.source.name,
            source_type: SourceType::Rss,
            keywords: &ctx.keywords,
            captured_at,
            ledger: &ctx.ledger,
        };
        let total = feed.entries.len();
        let records = feed
            .entries
            .iter()
            .map(entry_from_feed)
            .filter_map(|entry| normalize(entry, &norm))
            .collect::<Vec<_>>();

        debug!(entries = total, kept = records.len(), "normalized feed entries");
        Ok(records)
    }
}

#[async_trait]
impl SourceFetcher for FeedFetcher {
    fn source_name(&self) -> &str {
        &self.source.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rss
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError> {
        let span = info_span!(
            "source_fetch",
            source = %self.source.name,
            source_type = "rss",
            run_id = %ctx.run_id
        );
        self.fetch_records(ctx).instrument(span).await
    }
}
