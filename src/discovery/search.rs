//! Keyword search over a repository's rendered result pages.
//!
//! Result pages may be filled in by client-side rendering, so every page is
//! obtained through a [`PageRenderer`] that waits for a readiness selector to
//! match before links are read. The stock [`HttpPageRenderer`] re-fetches
//! the page until the selector appears or the readiness timeout expires.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{DiscoveryError, DiscoverySource, DiscoveryStats, fetch_with_retry};
use crate::download::{HttpClient, RateLimiter, RetryPolicy};
use crate::extract::{ExtractError, ParsedPage, SelectorChain, resolve_link};
use crate::registry::{ItemMetadata, ItemStatus, Registry, RegistryError};

/// Page type name for search result pages in selector configuration.
pub const SEARCH_RESULTS: &str = "search_results";

/// Pause between readiness polls.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Selector chains for a search results page.
#[derive(Debug, Clone)]
pub struct SearchSelectors {
    /// Links to item pages.
    pub result_link: SelectorChain,
    /// Link to the next results page.
    pub next_page: SelectorChain,
    /// Matches once result content is present.
    pub ready: SelectorChain,
}

impl Default for SearchSelectors {
    fn default() -> Self {
        Self {
            result_link: SelectorChain::builtin(&[
                "attr:div.artifact-title a@href",
                "attr:h4.title a@href",
                "attr:a[href*='/handle/']@href",
            ]),
            next_page: SelectorChain::builtin(&[
                "attr:a.next-page-link@href",
                "attr:a[rel='next']@href",
                "attr:li.next a@href",
            ]),
            ready: SelectorChain::builtin(&[
                "css:div.discovery-result-results",
                "css:div.ds-artifact-list",
                "attr:a[href*='/handle/']@href",
            ]),
        }
    }
}

impl SearchSelectors {
    /// Built-in chains with configured per-field chains swapped in.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::UnknownField`] for an unknown field name.
    pub fn with_overrides(overrides: &BTreeMap<String, SelectorChain>) -> Result<Self, ExtractError> {
        let mut selectors = Self::default();
        for (field, chain) in overrides {
            let slot = match field.as_str() {
                "result_link" => &mut selectors.result_link,
                "next_page" => &mut selectors.next_page,
                "ready" => &mut selectors.ready,
                other => return Err(ExtractError::unknown_field(SEARCH_RESULTS, other)),
            };
            *slot = chain.clone();
        }
        Ok(selectors)
    }
}

/// A fetched page and whether the readiness selector matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub ready: bool,
}

/// Produces the rendered HTML of a results page.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Loads `url` and waits up to `timeout` for `ready` to match.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Http`] if the page cannot be loaded at all.
    async fn render(
        &self,
        url: &str,
        ready: &SelectorChain,
        timeout: Duration,
    ) -> Result<RenderedPage, DiscoveryError>;
}

fn is_ready(html: &str, ready: &SelectorChain) -> bool {
    ready.evaluate(&ParsedPage::parse(html)).is_some()
}

/// Renderer that polls the server-side HTML.
#[derive(Debug, Clone)]
pub struct HttpPageRenderer {
    client: HttpClient,
    rate_limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl HttpPageRenderer {
    #[must_use]
    pub fn new(client: HttpClient, rate_limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            client,
            rate_limiter,
            policy,
            poll_interval: READY_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn render(
        &self,
        url: &str,
        ready: &SelectorChain,
        timeout: Duration,
    ) -> Result<RenderedPage, DiscoveryError> {
        let deadline = Instant::now() + timeout;
        loop {
            let html =
                fetch_with_retry(&self.client, &self.rate_limiter, &self.policy, url, &[]).await?;
            if is_ready(&html, ready) {
                return Ok(RenderedPage {
                    url: url.to_string(),
                    html,
                    ready: true,
                });
            }
            if Instant::now() + self.poll_interval > deadline {
                return Ok(RenderedPage {
                    url: url.to_string(),
                    html,
                    ready: false,
                });
            }
            debug!(url, "results not ready yet, polling again");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Settings for one keyword-search source.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Source name recorded on registered items.
    pub name: String,
    pub base_url: String,
    /// Search URL with `{base}`, `{keyword}`, `{page}`, `{offset}` and
    /// `{page_size}` placeholders.
    pub url_template: String,
    pub keywords: Vec<String>,
    /// Result pages per keyword.
    pub max_pages: u32,
    /// Items registered per keyword.
    pub max_items_per_keyword: Option<usize>,
    pub page_size: u32,
    pub readiness_timeout: Duration,
    /// Pause between result page requests.
    pub request_delay: Duration,
}

impl SearchSettings {
    /// First results page URL for `keyword`.
    #[must_use]
    pub fn search_url(&self, keyword: &str, page: u32) -> String {
        let offset = page.saturating_sub(1).saturating_mul(self.page_size);
        self.url_template
            .replace("{base}", self.base_url.trim_end_matches('/'))
            .replace("{keyword}", &urlencoding::encode(keyword.trim()))
            .replace("{page}", &page.to_string())
            .replace("{offset}", &offset.to_string())
            .replace("{page_size}", &self.page_size.to_string())
    }
}

/// Item links and next-page link read from one results page.
fn read_results(
    selectors: &SearchSelectors,
    html: &str,
    page_url: &Url,
) -> (Vec<String>, Option<String>) {
    let page = ParsedPage::parse(html);
    let links = selectors
        .result_link
        .all(&page)
        .iter()
        .filter_map(|href| resolve_link(page_url, href))
        .map(|u| u.to_string())
        .collect();
    let next = selectors
        .next_page
        .first(&page)
        .and_then(|href| resolve_link(page_url, &href))
        .map(|u| u.to_string());
    (links, next)
}

/// Walks keyword search results and registers every item link.
pub struct KeywordSearcher {
    settings: SearchSettings,
    selectors: SearchSelectors,
    renderer: Arc<dyn PageRenderer>,
}

impl std::fmt::Debug for KeywordSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordSearcher")
            .field("settings", &self.settings)
            .field("selectors", &self.selectors)
            .finish_non_exhaustive()
    }
}

impl KeywordSearcher {
    #[must_use]
    pub fn new(
        settings: SearchSettings,
        selectors: SearchSelectors,
        renderer: Arc<dyn PageRenderer>,
    ) -> Self {
        Self {
            settings,
            selectors,
            renderer,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Searches one keyword. Returns early when `interrupted` is set.
    async fn search_keyword(
        &self,
        keyword: &str,
        registry: &Registry,
        seen: &mut HashSet<String>,
        interrupted: &AtomicBool,
        stats: &mut DiscoveryStats,
    ) -> Result<(), DiscoveryError> {
        let cap = self.settings.max_items_per_keyword.unwrap_or(usize::MAX);
        let mut registered_for_keyword = 0usize;
        let mut visited_pages: HashSet<String> = HashSet::new();
        let mut url = self.settings.search_url(keyword, 1);

        for page_number in 1..=self.settings.max_pages {
            if interrupted.load(Ordering::SeqCst) {
                break;
            }
            if page_number > 1 && !self.settings.request_delay.is_zero() {
                tokio::time::sleep(self.settings.request_delay).await;
            }
            visited_pages.insert(url.clone());

            let rendered = match self
                .renderer
                .render(&url, &self.selectors.ready, self.settings.readiness_timeout)
                .await
            {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!(keyword, page = page_number, error = %e, "search page failed");
                    stats.failed_pages += 1;
                    break;
                }
            };
            if !rendered.ready {
                warn!(keyword, page = page_number, url = %url, "results did not become ready in time");
            }
            stats.pages += 1;

            let Ok(page_url) = Url::parse(&rendered.url) else {
                stats.failed_pages += 1;
                break;
            };
            let (links, next) = read_results(&self.selectors, &rendered.html, &page_url);
            debug!(keyword, page = page_number, links = links.len(), "read results page");

            for link in links {
                if registered_for_keyword >= cap {
                    break;
                }
                stats.seen += 1;
                if !seen.insert(link.clone()) {
                    stats.skipped += 1;
                    continue;
                }
                match registry
                    .upsert(
                        &link,
                        &self.settings.name,
                        ItemStatus::HtmlPending,
                        &ItemMetadata::default(),
                    )
                    .await
                {
                    Ok(outcome) => {
                        if outcome.created {
                            stats.registered += 1;
                        }
                        registered_for_keyword += 1;
                    }
                    Err(RegistryError::InvalidIdentity(bad)) => {
                        debug!(link = %bad, "skipping unusable result link");
                        stats.skipped += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if registered_for_keyword >= cap {
                info!(keyword, cap, "per-keyword item cap reached");
                break;
            }

            match next {
                Some(next) if !visited_pages.contains(&next) => url = next,
                _ => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoverySource for KeywordSearcher {
    fn name(&self) -> &str {
        &self.settings.name
    }

    #[instrument(skip_all, fields(source = %self.settings.name))]
    async fn discover(
        &self,
        registry: &Registry,
        interrupted: &AtomicBool,
    ) -> Result<DiscoveryStats, DiscoveryError> {
        let mut stats = DiscoveryStats::default();
        let mut seen: HashSet<String> = HashSet::new();

        for keyword in &self.settings.keywords {
            if interrupted.load(Ordering::SeqCst) {
                info!("interrupted, stopping keyword search");
                break;
            }
            info!(keyword = %keyword, "searching keyword");
            self.search_keyword(keyword, registry, &mut seen, interrupted, &mut stats)
                .await?;
        }

        info!(
            pages = stats.pages,
            registered = stats.registered,
            skipped = stats.skipped,
            "keyword search finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn settings() -> SearchSettings {
        SearchSettings {
            name: "search".to_string(),
            base_url: "https://repo.example/".to_string(),
            url_template: "{base}/discover?query={keyword}&page={page}&start={offset}&rpp={page_size}"
                .to_string(),
            keywords: vec!["soja".to_string()],
            max_pages: 3,
            max_items_per_keyword: None,
            page_size: 20,
            readiness_timeout: Duration::from_secs(1),
            request_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_builtin_search_chains_all_parse() {
        let selectors = SearchSelectors::default();
        for chain in [&selectors.result_link, &selectors.next_page, &selectors.ready] {
            assert_eq!(chain.rules().len(), 3, "{chain:?}");
        }
    }

    #[test]
    fn test_search_url_template() {
        let s = settings();
        assert_eq!(
            s.search_url("milho verde", 3),
            "https://repo.example/discover?query=milho%20verde&page=3&start=40&rpp=20"
        );
    }

    #[test]
    fn test_read_results_skips_script_and_fragment_links() {
        let html = r##"<html><body>
            <div class="artifact-title"><a href="/handle/doc/1">One</a></div>
            <div class="artifact-title"><a href="javascript:open(2)">Two</a></div>
            <div class="artifact-title"><a href="#3">Three</a></div>
            <div class="artifact-title"><a href="https://repo.example/handle/doc/4">Four</a></div>
            <a class="next-page-link" href="?page=2">Next</a>
            </body></html>"##;
        let page_url = Url::parse("https://repo.example/discover?page=1").unwrap();
        let (links, next) = read_results(&SearchSelectors::default(), html, &page_url);
        assert_eq!(
            links,
            vec![
                "https://repo.example/handle/doc/1",
                "https://repo.example/handle/doc/4"
            ]
        );
        assert_eq!(next.as_deref(), Some("https://repo.example/discover?page=2"));
    }

    #[test]
    fn test_read_results_script_next_link_ends_paging() {
        let html = r#"<html><body><a rel="next" href="javascript:next()">Next</a></body></html>"#;
        let page_url = Url::parse("https://repo.example/discover").unwrap();
        let (links, next) = read_results(&SearchSelectors::default(), html, &page_url);
        assert!(links.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn test_is_ready() {
        let ready = SelectorChain::parse(["css:div.results"]).unwrap();
        assert!(is_ready(r#"<div class="results">x</div>"#, &ready));
        assert!(!is_ready(r#"<div class="spinner"></div>"#, &ready));
    }

    #[test]
    fn test_selector_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "ready".to_string(),
            SelectorChain::parse(["css:ul.items"]).unwrap(),
        );
        let selectors = SearchSelectors::with_overrides(&overrides).unwrap();
        assert_eq!(selectors.ready.rules()[0].to_string(), "css:ul.items");

        overrides.insert("title".to_string(), SelectorChain::parse(["css:h1"]).unwrap());
        assert!(SearchSelectors::with_overrides(&overrides).is_err());
    }
}
