//! Source fetcher contracts, per-source-type payload adapters, and the payload normalizer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobhound_core::{JobRecord, SourceType};
use jobhound_storage::{FetchError, LedgerView};
use thiserror::Error;
use uuid::Uuid;

mod api;
mod feed;
pub mod normalize;
pub mod payload;
mod search;
mod session;

pub use api::ApiFetcher;
pub use feed::FeedFetcher;
pub use normalize::{normalize, NormalizeContext, RawEntry};
pub use search::{PageState, SearchFetcher, SearchSettings};
pub use session::{SessionCookie, SessionState};

pub const CRATE_NAME: &str = "jobhound-adapters";

/// Default user-agent for feed and API requests.
pub const DEFAULT_USER_AGENT: &str = concat!("jobhound/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_name}: malformed payload: {detail}")]
    Parse { source_name: String, detail: String },
    #[error("session: {0}")]
    Session(String),
    #[error("{source_name}: no page completed within {}s", budget.as_secs())]
    OutOfTime { source_name: String, budget: Duration },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn parse(source_name: &str, detail: impl Into<String>) -> Self {
        AdapterError::Parse {
            source_name: source_name.to_string(),
            detail: detail.into(),
        }
    }
}

/// Run-scoped inputs shared by every fetch task.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    /// Category keywords, in priority order.
    pub keywords: Arc<[String]>,
    pub ledger: LedgerView,
}

impl FetchContext {
    pub fn new(run_id: Uuid, keywords: impl Into<Arc<[String]>>, ledger: LedgerView) -> Self {
        Self {
            run_id,
            keywords: keywords.into(),
            ledger,
        }
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_name(&self) -> &str;
    fn source_type(&self) -> SourceType;

    /// Fetch and normalize one source. Known `job_id`s are already filtered out.
    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<JobRecord>, AdapterError>;
}
