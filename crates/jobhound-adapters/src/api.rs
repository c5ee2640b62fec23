use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jobhound_core::{JobRecord, SourceDescriptor, SourceType};
use jobhound_storage::{FetchError, FetchRequest, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::normalize::{normalize, NormalizeContext};
use crate::payload::{api_items, entry_from_api_item};
use crate::{AdapterError, FetchContext, SourceFetcher};

/// JSON API source. Requires a 2xx JSON body; see [`api_items`] for the accepted shapes.
pub struct ApiFetcher {
    source: SourceDescriptor,
    http: Arc<HttpFetcher>,
}

impl ApiFetcher {
    pub fn new(source: SourceDescriptor, http: Arc<HttpFetcher>) -> Self {
        Self { source, http }
    }

    async fn fetch_records(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError> {
        let request = FetchRequest::get(&self.source.url)
            .with_query(self.source.query_pairs())
            .with_header("Accept", "application/json");
        let response = self.http.fetch(&request).await?;
        if !response.status.is_success() {
            return Err(FetchError::HttpStatus {
                status: response.status.as_u16(),
                url: response.final_url,
            }
            .into());
        }
        let captured_at = Utc::now();

        let body: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|err| AdapterError::parse(&self.source.name, format!("invalid JSON: {err}")))?;
        let items = api_items(&body, self.source.items_path.as_deref())
            .map_err(|detail| AdapterError::parse(&self.source.name, detail))?;

        let norm = NormalizeContext {
            source_name: &self.source.name,
            source_type: SourceType::Api,
            keywords: &ctx.keywords,
            captured_at,
            ledger: &ctx.ledger,
        };
        let total = items.len();
        let records = items
            .into_iter()
            .map(entry_from_api_item)
            .filter_map(|entry| normalize(entry, &norm))
            .collect::<Vec<_>>();

        debug!(items = total, kept = records.len(), "normalized api items");
        Ok(records)
    }
}

#[async_trait]
impl SourceFetcher for ApiFetcher {
    fn source_name(&self) -> &str {
        &self.source.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Api
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError> {
        let span = info_span!(
            "source_fetch",
            source = %self.source.name,
            source_type = "api",
            run_id = %ctx.run_id
        );
        self.fetch_records(ctx).instrument(span).await
    }
}
