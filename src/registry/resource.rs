//! Resource ledger entries.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// What a resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Pdf,
    HtmlSnapshot,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::HtmlSnapshot => "html_snapshot",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(Self::Pdf),
            "html_snapshot" => Ok(Self::HtmlSnapshot),
            _ => Err(format!("invalid resource kind: {s}")),
        }
    }
}

/// Download state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Scheduled, not yet fetched successfully.
    Pending,
    /// Stored locally with a verified hash. Immutable from here on.
    Downloaded,
    /// Retries exhausted on transient failures; a later run may try again.
    FailedTransient,
    /// Non-retryable failure. Never fetched again.
    FailedPermanent,
}

impl ResourceStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Downloaded,
        Self::FailedTransient,
        Self::FailedPermanent,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Whether the outcome of this resource is settled.
    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Downloaded | Self::FailedPermanent)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid resource status: {s}"))
    }
}

/// One row of the `resources` table.
#[derive(Debug, Clone, FromRow)]
pub struct Resource {
    pub id: i64,
    pub item_id: i64,
    /// Canonical remote URL.
    pub url: String,
    #[sqlx(rename = "kind")]
    pub kind_str: String,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub local_path: Option<String>,
    /// Lowercase hex MD5 of the stored bytes.
    pub md5: Option<String>,
    pub size_bytes: Option<i64>,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Resource {
    /// Returns the parsed status, falling back to `pending`.
    #[must_use]
    pub fn status(&self) -> ResourceStatus {
        self.status_str.parse().unwrap_or(ResourceStatus::Pending)
    }

    /// Returns the parsed kind, falling back to `pdf`.
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind_str.parse().unwrap_or(ResourceKind::Pdf)
    }

    /// Downloaded with a recorded hash.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status() == ResourceStatus::Downloaded && self.md5.is_some()
    }
}

/// Outcome written to the ledger after a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub local_path: String,
    pub md5: String,
    pub size_bytes: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_parse() {
        assert_eq!("pdf".parse::<ResourceKind>().unwrap(), ResourceKind::Pdf);
        assert_eq!(
            "html_snapshot".parse::<ResourceKind>().unwrap(),
            ResourceKind::HtmlSnapshot
        );
        assert!("video".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_resource_status_resolution() {
        assert!(ResourceStatus::Downloaded.is_resolved());
        assert!(ResourceStatus::FailedPermanent.is_resolved());
        assert!(!ResourceStatus::FailedTransient.is_resolved());
        assert!(!ResourceStatus::Pending.is_resolved());
    }

    #[test]
    fn test_resource_status_round_trip() {
        for status in ResourceStatus::ALL {
            assert_eq!(status.as_str().parse::<ResourceStatus>().unwrap(), status);
        }
    }
}
