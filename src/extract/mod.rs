//! Extraction stage: item page fetch, HTML snapshot, metadata fields and PDF
//! link resolution.
//!
//! Each field is read through its own [`SelectorChain`]. The PDF URL is
//! resolved in three tiers, stopping at the first hit:
//!
//! 1. a URL already resolved at discovery time,
//! 2. the `pdf_link` selector chain,
//! 3. any link on the page whose target looks like a repository binary.
//!
//! An item whose page yields no PDF at all ends in `no_pdf_found` instead of
//! being retried.

mod doi;
mod error;
pub mod selector;

pub use doi::{detect_doi, find_doi};
pub use error::ExtractError;
pub use selector::{ParsedPage, SelectorChain, SelectorRule};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use scraper::Selector;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::download::filename::snapshot_path;
use crate::download::{HttpClient, RateLimiter, bytes_md5};
use crate::registry::{Item, ItemMetadata, ItemStatus, Registry, RegistryError, Stage, StoredFile};

/// Page type name for item pages in selector configuration.
pub const ITEM_PAGE: &str = "item_page";

/// Selector chains for every field of an item page.
#[derive(Debug, Clone)]
pub struct ItemPageSelectors {
    pub title: SelectorChain,
    pub authors: SelectorChain,
    pub date: SelectorChain,
    pub abstract_text: SelectorChain,
    pub subjects: SelectorChain,
    pub doi: SelectorChain,
    pub canonical_uri: SelectorChain,
    pub pdf_link: SelectorChain,
}

impl Default for ItemPageSelectors {
    fn default() -> Self {
        Self {
            title: SelectorChain::builtin(&[
                "meta:DC.title",
                "meta:citation_title",
                "css:h2.page-header",
                "css:h1",
            ]),
            authors: SelectorChain::builtin(&[
                "meta:DC.creator",
                "meta:citation_author",
                "meta:DC.contributor.author",
            ]),
            date: SelectorChain::builtin(&[
                "meta:DCTERMS.issued",
                "meta:citation_date",
                "meta:citation_publication_date",
                "meta:DC.date",
            ]),
            abstract_text: SelectorChain::builtin(&[
                "meta:DCTERMS.abstract",
                "meta:DC.description",
                "meta:description",
            ]),
            subjects: SelectorChain::builtin(&["meta:DC.subject", "meta:citation_keywords"]),
            doi: SelectorChain::builtin(&[
                "meta:citation_doi",
                r#"regex:(?i)doi:\s*(10\.\d{4,9}/[^\s"<>]+)"#,
                r#"regex:https?://(?:dx\.)?doi\.org/(10\.\d{4,9}/[^\s"<>]+)"#,
            ]),
            canonical_uri: SelectorChain::builtin(&[
                "attr:link[rel='canonical']@href",
                r#"regex:(https?://hdl\.handle\.net/[^\s"<>]+)"#,
                "meta:DC.identifier",
            ]),
            pdf_link: SelectorChain::builtin(&[
                "meta:citation_pdf_url",
                "attr:a[href*='/bitstream/'][href$='.pdf']@href",
                "attr:a[href*='type=application/pdf']@href",
                "attr:a[href*='/bitstream/']@href",
            ]),
        }
    }
}

impl ItemPageSelectors {
    /// Built-in chains with configured per-field chains swapped in.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::UnknownField`] for a field this page type
    /// does not have.
    pub fn with_overrides(overrides: &BTreeMap<String, SelectorChain>) -> Result<Self, ExtractError> {
        let mut selectors = Self::default();
        for (field, chain) in overrides {
            let slot = match field.as_str() {
                "title" => &mut selectors.title,
                "authors" => &mut selectors.authors,
                "date" => &mut selectors.date,
                "abstract" => &mut selectors.abstract_text,
                "subjects" => &mut selectors.subjects,
                "doi" => &mut selectors.doi,
                "canonical_uri" => &mut selectors.canonical_uri,
                "pdf_link" => &mut selectors.pdf_link,
                other => return Err(ExtractError::unknown_field(ITEM_PAGE, other)),
            };
            *slot = chain.clone();
        }
        Ok(selectors)
    }
}

/// Where the resolved PDF URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdfSource {
    /// Already known from discovery metadata.
    Discovery,
    /// The `pdf_link` selector chain.
    FieldSelector,
    /// Generic scan of every link on the page.
    GenericFallback,
}

/// Fields read from one item page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageExtraction {
    pub metadata: ItemMetadata,
    pub pdf: Option<(String, PdfSource)>,
}

/// Reads every field of a fetched item page. Pure over its inputs.
#[must_use]
pub fn extract_page(
    selectors: &ItemPageSelectors,
    html: &str,
    page_url: &Url,
    known_pdf_url: Option<&str>,
) -> PageExtraction {
    let page = ParsedPage::parse(html);

    let doi = selectors
        .doi
        .all(&page)
        .iter()
        .find_map(|value| detect_doi(value));

    let metadata = ItemMetadata {
        title: selectors.title.first(&page),
        authors: selectors.authors.all(&page),
        publication_date: selectors.date.first(&page),
        abstract_text: selectors.abstract_text.first(&page),
        subjects: selectors.subjects.all(&page),
        doi,
        canonical_uri: selectors.canonical_uri.first(&page),
        ..ItemMetadata::default()
    };

    let pdf = resolve_pdf_link(selectors, &page, page_url, known_pdf_url);
    PageExtraction { metadata, pdf }
}

fn is_followable(href: &str) -> bool {
    let href = href.trim();
    !href.is_empty()
        && !href.starts_with('#')
        && !href.to_ascii_lowercase().starts_with("javascript:")
}

/// Resolves `href` against `base`, keeping only http(s) targets.
pub(crate) fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    if !is_followable(href) {
        return None;
    }
    let resolved = base.join(href.trim()).ok()?;
    matches!(resolved.scheme(), "http" | "https").then_some(resolved)
}

fn looks_like_binary(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    path.ends_with(".pdf") || path.contains("/bitstream/")
}

fn resolve_pdf_link(
    selectors: &ItemPageSelectors,
    page: &ParsedPage<'_>,
    page_url: &Url,
    known_pdf_url: Option<&str>,
) -> Option<(String, PdfSource)> {
    if let Some(known) = known_pdf_url.and_then(|u| resolve_link(page_url, u)) {
        return Some((known.to_string(), PdfSource::Discovery));
    }

    if let Some((rule, hrefs)) = selectors.pdf_link.evaluate(page) {
        if let Some(url) = hrefs.iter().find_map(|h| resolve_link(page_url, h)) {
            debug!(rule = %rule, "pdf link from field selector");
            return Some((url.to_string(), PdfSource::FieldSelector));
        }
    }

    let anchors = Selector::parse("a[href]").ok()?;
    page.document()
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| resolve_link(page_url, href))
        .find(looks_like_binary)
        .map(|url| (url.to_string(), PdfSource::GenericFallback))
}

/// What the extraction stage did with one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// Metadata stored and the item queued for download.
    PdfResolved { pdf_url: String, source: PdfSource },
    /// Metadata stored; no PDF link on the page.
    NoPdfFound,
    /// Fetch or snapshot failed; the item moved to `status`.
    Failed { status: ItemStatus, error: String },
    /// Another worker changed the item first, or it is not extractable.
    Skipped,
}

/// Runs the extraction stage for items in extraction statuses.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    client: HttpClient,
    registry: Registry,
    rate_limiter: Arc<RateLimiter>,
    selectors: ItemPageSelectors,
    snapshot_root: PathBuf,
    max_item_attempts: u32,
}

impl MetadataExtractor {
    #[must_use]
    pub fn new(
        client: HttpClient,
        registry: Registry,
        rate_limiter: Arc<RateLimiter>,
        selectors: ItemPageSelectors,
        snapshot_root: impl Into<PathBuf>,
        max_item_attempts: u32,
    ) -> Self {
        Self {
            client,
            registry,
            rate_limiter,
            selectors,
            snapshot_root: snapshot_root.into(),
            max_item_attempts: max_item_attempts.max(1),
        }
    }

    /// Fetches, snapshots and extracts one item, then moves it forward.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] only when the registry itself fails.
    #[instrument(skip(self, item), fields(item_id = item.id, status = %item.status()))]
    pub async fn process_item(&self, item: &Item) -> Result<ExtractionOutcome, RegistryError> {
        let status = item.status();
        if status.stage() != Some(Stage::Extraction) {
            debug!("item not in an extraction status");
            return Ok(ExtractionOutcome::Skipped);
        }

        let extraction = match self.fetch_and_extract(item).await {
            Ok(extraction) => extraction,
            Err(ExtractError::Registry(e)) if e.is_conflict() => return Ok(skipped(&e)),
            Err(ExtractError::Registry(e)) => return Err(e),
            Err(e) => return self.record_failure(item, status, &e).await,
        };

        let (target, outcome) = match &extraction.pdf {
            Some((pdf_url, source)) => (
                ItemStatus::AwaitingDownload,
                ExtractionOutcome::PdfResolved {
                    pdf_url: pdf_url.clone(),
                    source: *source,
                },
            ),
            None => (ItemStatus::NoPdfFound, ExtractionOutcome::NoPdfFound),
        };

        let mut patch = extraction.metadata;
        if let Some((pdf_url, _)) = extraction.pdf {
            patch.pdf_url = Some(pdf_url);
        }

        match self.advance(item.id, status, target, &patch).await {
            Ok(()) => {
                match &outcome {
                    ExtractionOutcome::PdfResolved { pdf_url, source } => {
                        info!(pdf_url = %pdf_url, source = ?source, "pdf link resolved");
                    }
                    _ => info!("no pdf link on item page"),
                }
                Ok(outcome)
            }
            Err(e) if e.is_conflict() => Ok(skipped(&e)),
            Err(e) => Err(e),
        }
    }

    /// Writes the patch and walks the item through the lifecycle to `target`.
    async fn advance(
        &self,
        id: i64,
        status: ItemStatus,
        target: ItemStatus,
        patch: &ItemMetadata,
    ) -> Result<(), RegistryError> {
        match status {
            ItemStatus::HtmlProcessed | ItemStatus::PdfLinkPending => {
                self.registry
                    .transition_with_patch(id, status, target, patch)
                    .await
            }
            _ => {
                self.registry
                    .transition_with_patch(id, status, ItemStatus::HtmlProcessed, patch)
                    .await?;
                self.registry
                    .transition(id, ItemStatus::HtmlProcessed, target)
                    .await
            }
        }
    }

    async fn fetch_and_extract(&self, item: &Item) -> Result<PageExtraction, ExtractError> {
        let page_url = Url::parse(&item.url)
            .map_err(|_| crate::download::DownloadError::invalid_url(&item.url))?;

        self.rate_limiter.acquire(&item.url).await;
        let html = self.client.get_text(&item.url, &[]).await?;

        let path = snapshot_path(&self.snapshot_root, item.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ExtractError::Snapshot {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&path, html.as_bytes())
            .await
            .map_err(|source| ExtractError::Snapshot {
                path: path.clone(),
                source,
            })?;

        let stored = StoredFile {
            local_path: path.display().to_string(),
            md5: bytes_md5(html.as_bytes()),
            size_bytes: html.len() as u64,
        };
        self.registry
            .record_snapshot(item.id, &item.url, &stored)
            .await?;
        debug!(path = %path.display(), bytes = html.len(), "snapshot written");

        let mut extraction =
            extract_page(&self.selectors, &html, &page_url, item.pdf_url.as_deref());
        extraction.metadata.snapshot_path = Some(stored.local_path);
        Ok(extraction)
    }

    async fn record_failure(
        &self,
        item: &Item,
        status: ItemStatus,
        error: &ExtractError,
    ) -> Result<ExtractionOutcome, RegistryError> {
        let message = error.to_string();
        match self
            .registry
            .record_failure(
                item.id,
                status,
                Stage::Extraction,
                &message,
                self.max_item_attempts,
            )
            .await
        {
            Ok(new_status) => {
                warn!(
                    url = %item.url,
                    attempts = item.error_count + 1,
                    item_status = %new_status,
                    error = %message,
                    "extraction failed"
                );
                Ok(ExtractionOutcome::Failed {
                    status: new_status,
                    error: message,
                })
            }
            Err(e) if e.is_conflict() => Ok(skipped(&e)),
            Err(e) => Err(e),
        }
    }
}

fn skipped(error: &RegistryError) -> ExtractionOutcome {
    debug!(error = %error, "item changed under us, skipping");
    ExtractionOutcome::Skipped
}
