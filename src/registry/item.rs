//! Item types, the status lifecycle, and incremental metadata merging.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a registry item.
///
/// ```text
/// discovered → html_pending → html_processed → pdf_link_pending → awaiting_download → processed
///                     ↓                              ↓                    ↓
///                 error_html ────────────────────────┘               error_download
///                     ↓                                                   ↓
///              failed_permanent  ←────────────────────────────────────────┘
/// ```
///
/// `no_pdf_found` is the terminal outcome of an extraction that fetched the page
/// successfully but could not resolve any PDF link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Seen by a discovery source, nothing else known yet.
    Discovered,
    /// Item page must be fetched and extracted.
    HtmlPending,
    /// Page snapshot and metadata stored, PDF link not yet resolved.
    HtmlProcessed,
    /// Metadata known from discovery, PDF link still to be resolved.
    PdfLinkPending,
    /// PDF URL resolved, waiting for the downloader.
    AwaitingDownload,
    /// Every expected resource resolved with at least one downloaded.
    Processed,
    /// Page extracted but no PDF link could be resolved.
    NoPdfFound,
    /// Extraction failed; retried until the attempt bound.
    ErrorHtml,
    /// Download failed; retried until the attempt bound.
    ErrorDownload,
    /// Attempt bound exceeded. Never picked up again.
    FailedPermanent,
}

/// Classification consulted by the orchestrator instead of comparing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Waiting for its stage to pick it up.
    InProgress,
    /// Failed within a stage, eligible for another attempt.
    Retryable,
    /// No further automated processing.
    Terminal,
}

/// Pipeline stage that acts on items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Page fetch, snapshot, metadata and PDF-link resolution.
    Extraction,
    /// Binary resource download.
    Download,
}

impl Stage {
    /// Statuses this stage reads from the registry, in priority order.
    #[must_use]
    pub fn actionable_statuses(self) -> &'static [ItemStatus] {
        match self {
            Self::Extraction => &[
                ItemStatus::Discovered,
                ItemStatus::HtmlPending,
                ItemStatus::HtmlProcessed,
                ItemStatus::PdfLinkPending,
                ItemStatus::ErrorHtml,
            ],
            Self::Download => &[ItemStatus::AwaitingDownload, ItemStatus::ErrorDownload],
        }
    }

    /// Status an item moves to when this stage fails it.
    #[must_use]
    pub fn error_status(self) -> ItemStatus {
        match self {
            Self::Extraction => ItemStatus::ErrorHtml,
            Self::Download => ItemStatus::ErrorDownload,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ItemStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 10] = [
        Self::Discovered,
        Self::HtmlPending,
        Self::HtmlProcessed,
        Self::PdfLinkPending,
        Self::AwaitingDownload,
        Self::Processed,
        Self::NoPdfFound,
        Self::ErrorHtml,
        Self::ErrorDownload,
        Self::FailedPermanent,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::HtmlPending => "html_pending",
            Self::HtmlProcessed => "html_processed",
            Self::PdfLinkPending => "pdf_link_pending",
            Self::AwaitingDownload => "awaiting_download",
            Self::Processed => "processed",
            Self::NoPdfFound => "no_pdf_found",
            Self::ErrorHtml => "error_html",
            Self::ErrorDownload => "error_download",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Terminal/retryable classification table.
    #[must_use]
    pub fn class(self) -> StatusClass {
        match self {
            Self::Discovered
            | Self::HtmlPending
            | Self::HtmlProcessed
            | Self::PdfLinkPending
            | Self::AwaitingDownload => StatusClass::InProgress,
            Self::ErrorHtml | Self::ErrorDownload => StatusClass::Retryable,
            Self::Processed | Self::NoPdfFound | Self::FailedPermanent => StatusClass::Terminal,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.class() == StatusClass::Terminal
    }

    /// The stage that picks items up in this status, if any.
    #[must_use]
    pub fn stage(self) -> Option<Stage> {
        [Stage::Extraction, Stage::Download]
            .into_iter()
            .find(|stage| stage.actionable_statuses().contains(&self))
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid item status: {s}"))
    }
}

/// Bibliographic metadata for an item.
///
/// Every field is optional; discovery, extraction and download each patch in
/// what they learn. Empty strings and empty lists count as "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    pub publication_date: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    pub doi: Option<String>,
    /// Canonical URI advertised by the repository (usually a handle).
    pub canonical_uri: Option<String>,
    /// Resolved PDF URL.
    pub pdf_url: Option<String>,
    /// Local path of the latest HTML snapshot.
    pub snapshot_path: Option<String>,
    /// OAI header identifier when the item came from a metadata harvest.
    pub oai_identifier: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub resource_type: Option<String>,
}

fn merge_scalar(target: &mut Option<String>, patch: Option<&String>) -> bool {
    let Some(value) = patch.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return false;
    };
    if target.as_deref() == Some(value) {
        return false;
    }
    *target = Some(value.to_string());
    true
}

fn merge_list(target: &mut Vec<String>, patch: &[String]) -> bool {
    let cleaned: Vec<String> = patch
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if cleaned.is_empty() || *target == cleaned {
        return false;
    }
    *target = cleaned;
    true
}

impl ItemMetadata {
    /// Merges `patch` into `self`.
    ///
    /// Populated fields in the patch replace stored values; empty ones never
    /// clear a stored value. Returns whether anything changed.
    pub fn merge(&mut self, patch: &ItemMetadata) -> bool {
        let mut changed = false;
        changed |= merge_scalar(&mut self.title, patch.title.as_ref());
        changed |= merge_list(&mut self.authors, &patch.authors);
        changed |= merge_scalar(&mut self.publication_date, patch.publication_date.as_ref());
        changed |= merge_scalar(&mut self.abstract_text, patch.abstract_text.as_ref());
        changed |= merge_list(&mut self.subjects, &patch.subjects);
        changed |= merge_scalar(&mut self.doi, patch.doi.as_ref());
        changed |= merge_scalar(&mut self.canonical_uri, patch.canonical_uri.as_ref());
        changed |= merge_scalar(&mut self.pdf_url, patch.pdf_url.as_ref());
        changed |= merge_scalar(&mut self.snapshot_path, patch.snapshot_path.as_ref());
        changed |= merge_scalar(&mut self.oai_identifier, patch.oai_identifier.as_ref());
        changed |= merge_scalar(&mut self.publisher, patch.publisher.as_ref());
        changed |= merge_scalar(&mut self.language, patch.language.as_ref());
        changed |= merge_scalar(&mut self.resource_type, patch.resource_type.as_ref());
        changed
    }

    /// Returns true when no field carries a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Serializes a list field for storage; empty lists are stored as NULL.
    pub(crate) fn encode_list(values: &[String]) -> Option<String> {
        if values.is_empty() {
            return None;
        }
        serde_json::to_string(values).ok()
    }

    pub(crate) fn decode_list(raw: Option<&str>) -> Vec<String> {
        raw.and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }
}

/// One row of the `items` table.
#[derive(Debug, Clone, FromRow)]
pub struct Item {
    pub id: i64,
    /// Canonical URL, the item's identity.
    pub url: String,
    /// Name of the discovery source that first registered the item.
    pub source: String,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub title: Option<String>,
    /// JSON array.
    pub authors: Option<String>,
    pub publication_date: Option<String>,
    pub abstract_text: Option<String>,
    /// JSON array.
    pub subjects: Option<String>,
    pub doi: Option<String>,
    pub canonical_uri: Option<String>,
    pub pdf_url: Option<String>,
    pub snapshot_path: Option<String>,
    pub oai_identifier: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub resource_type: Option<String>,
    /// Failed attempts across all stages.
    pub error_count: i64,
    pub last_error: Option<String>,
    /// Bumped on every write; guards concurrent metadata merges.
    pub revision: i64,
    pub discovered_at: String,
    pub updated_at: String,
}

impl Item {
    /// Returns the parsed status.
    ///
    /// An unrecognized stored value is treated as `failed_permanent` so that
    /// no stage ever acts on it.
    #[must_use]
    pub fn status(&self) -> ItemStatus {
        self.status_str.parse().unwrap_or(ItemStatus::FailedPermanent)
    }

    /// Assembles the metadata mapping from the stored columns.
    #[must_use]
    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            title: self.title.clone(),
            authors: ItemMetadata::decode_list(self.authors.as_deref()),
            publication_date: self.publication_date.clone(),
            abstract_text: self.abstract_text.clone(),
            subjects: ItemMetadata::decode_list(self.subjects.as_deref()),
            doi: self.doi.clone(),
            canonical_uri: self.canonical_uri.clone(),
            pdf_url: self.pdf_url.clone(),
            snapshot_path: self.snapshot_path.clone(),
            oai_identifier: self.oai_identifier.clone(),
            publisher: self.publisher.clone(),
            language: self.language.clone(),
            resource_type: self.resource_type.clone(),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Item {{ id: {}, url: {}, status: {} }}",
            self.id,
            self.url,
            self.status()
        )
    }
}
