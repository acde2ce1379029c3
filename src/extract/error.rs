//! Error types for metadata extraction.

use std::path::PathBuf;

use thiserror::Error;

use crate::download::DownloadError;
use crate::registry::RegistryError;

/// Errors raised while extracting an item page.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The item page could not be fetched.
    #[error("failed to fetch item page: {0}")]
    Fetch(#[from] DownloadError),

    /// A configured selector rule does not parse.
    #[error("invalid selector rule '{rule}': {reason}")]
    InvalidSelector { rule: String, reason: String },

    /// A configured field name is not known for the page type.
    #[error("unknown field '{field}' for page type '{page_type}'")]
    UnknownField { page_type: String, field: String },

    /// The snapshot could not be written.
    #[error("failed to write snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A registry write failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ExtractError {
    pub fn invalid_selector(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            rule: rule.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_field(page_type: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            page_type: page_type.into(),
            field: field.into(),
        }
    }
}
