//! Discovery sources: everything that finds new items and registers them.
//!
//! Both sources implement [`DiscoverySource`]: produce item URLs with
//! whatever preliminary metadata is at hand and register them through the
//! [`Registry`]. The orchestrator runs them uniformly, one after another.
//!
//! - [`OaiHarvester`] pages through an OAI-PMH `ListRecords` endpoint.
//! - [`KeywordSearcher`] walks a repository's keyword search results.

mod oai;
mod search;

pub use oai::{
    DEFAULT_MAX_PAGES, ListRecordsPage, OaiHarvester, OaiRecordFields, OaiSettings,
    parse_list_records,
};
pub use search::{
    HttpPageRenderer, KeywordSearcher, PageRenderer, RenderedPage, SEARCH_RESULTS,
    SearchSelectors, SearchSettings,
};

use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::download::{DownloadError, HttpClient, RateLimiter, RetryDecision, RetryPolicy, classify_error};
use crate::registry::{Registry, RegistryError};

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The endpoint answered with something that is not a valid response.
    #[error("protocol error from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },

    /// The endpoint could not be reached.
    #[error(transparent)]
    Http(#[from] DownloadError),

    /// Registering an item failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DiscoveryError {
    pub fn protocol(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Counters for one discovery source run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    /// Result or record pages fetched successfully.
    pub pages: u64,
    /// Pages that failed after retries.
    pub failed_pages: u64,
    /// Items seen (records or result links) before deduplication.
    pub seen: u64,
    /// Items registered for the first time.
    pub registered: u64,
    /// Existing items whose metadata changed.
    pub updated: u64,
    /// Records skipped (deleted, unusable identity, duplicate in run).
    pub skipped: u64,
}

impl DiscoveryStats {
    pub(crate) fn absorb(&mut self, other: &DiscoveryStats) {
        self.pages += other.pages;
        self.failed_pages += other.failed_pages;
        self.seen += other.seen;
        self.registered += other.registered;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// A source of items for the registry.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Name recorded as the item `source` and used in logs.
    fn name(&self) -> &str;

    /// Runs the source to completion or until `interrupted` is set.
    ///
    /// Page-level failures are logged and counted, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Registry`] when registering fails.
    async fn discover(
        &self,
        registry: &Registry,
        interrupted: &AtomicBool,
    ) -> Result<DiscoveryStats, DiscoveryError>;
}

/// GETs a page under the retry policy, pacing each attempt.
pub(crate) async fn fetch_with_retry(
    client: &HttpClient,
    rate_limiter: &RateLimiter,
    policy: &RetryPolicy,
    url: &str,
    query: &[(&str, &str)],
) -> Result<String, DownloadError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        rate_limiter.acquire(url).await;
        match client.get_text(url, query).await {
            Ok(body) => return Ok(body),
            Err(e) => match policy.should_retry(classify_error(&e), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    info!(
                        url,
                        attempt = next_attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "retrying page request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url, %reason, "not retrying page request");
                    return Err(e);
                }
            },
        }
    }
}
