//! Item registry: the single source of truth for pipeline state.
//!
//! Every discovered item lives in the `items` table keyed by its canonical URL,
//! and every file fetched for it lives in the `resources` ledger keyed by
//! `(item, canonical URL)`. Stages never hold state of their own: they query
//! items in the statuses they own, do their work, and write forward through a
//! status-guarded transition.
//!
//! # Overview
//!
//! - [`Registry`] - Main interface for registry operations
//! - [`Item`] / [`ItemMetadata`] - Stored item and its mergeable metadata
//! - [`ItemStatus`] / [`Stage`] - Closed lifecycle and the stages acting on it
//! - [`Resource`] - One ledger entry (PDF or HTML snapshot)
//! - [`RegistryError`] - Operation error types
//!
//! # Example
//!
//! ```ignore
//! use harvester_core::registry::{ItemMetadata, ItemStatus, Registry};
//! use harvester_core::Database;
//!
//! let registry = Registry::new(Database::new_in_memory().await?);
//! let outcome = registry
//!     .upsert("https://repo.example/handle/1/2", "oai", ItemStatus::PdfLinkPending, &ItemMetadata::default())
//!     .await?;
//! registry
//!     .transition(outcome.id, ItemStatus::PdfLinkPending, ItemStatus::AwaitingDownload)
//!     .await?;
//! ```

mod error;
mod item;
mod resource;

pub use error::{DbErrorKind, RegistryError};
pub use item::{Item, ItemMetadata, ItemStatus, Stage, StatusClass};
pub use resource::{Resource, ResourceKind, ResourceStatus, StoredFile};

use sqlx::{Row, Sqlite};
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::db::Database;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Re-read/merge rounds before a contended metadata write gives up.
const MAX_MERGE_ATTEMPTS: u32 = 5;

/// Normalizes a URL into an item or resource identity.
///
/// Scheme and host are lowercased, the fragment is dropped, and surrounding
/// whitespace is ignored. Only absolute http(s) URLs are accepted.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidIdentity`] for anything else.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let mut url =
        Url::parse(trimmed).map_err(|_| RegistryError::InvalidIdentity(trimmed.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RegistryError::InvalidIdentity(trimmed.to_string()));
    }
    url.set_fragment(None);
    Ok(url.to_string())
}

/// What an [`Registry::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    /// A new row was inserted.
    pub created: bool,
    /// Stored metadata changed (always true when created).
    pub changed: bool,
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Binds the metadata columns in `items` column order.
fn bind_metadata<'q>(query: SqliteQuery<'q>, metadata: &'q ItemMetadata) -> SqliteQuery<'q> {
    query
        .bind(metadata.title.as_deref())
        .bind(ItemMetadata::encode_list(&metadata.authors))
        .bind(metadata.publication_date.as_deref())
        .bind(metadata.abstract_text.as_deref())
        .bind(ItemMetadata::encode_list(&metadata.subjects))
        .bind(metadata.doi.as_deref())
        .bind(metadata.canonical_uri.as_deref())
        .bind(metadata.pdf_url.as_deref())
        .bind(metadata.snapshot_path.as_deref())
        .bind(metadata.oai_identifier.as_deref())
        .bind(metadata.publisher.as_deref())
        .bind(metadata.language.as_deref())
        .bind(metadata.resource_type.as_deref())
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// SQLite-backed item registry and resource ledger.
#[derive(Debug, Clone)]
pub struct Registry {
    db: Database,
}

impl Registry {
    /// Creates a registry over an opened (and migrated) database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts the item if absent, otherwise merges `patch` into its metadata.
    ///
    /// `status_if_new` only applies on insert; an existing item keeps its
    /// status. Populated stored fields are never cleared by empty patch
    /// values, so repeated calls with identical input are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidIdentity`] for a non-URL identity,
    /// [`RegistryError::MergeContention`] if concurrent writers keep winning,
    /// or [`RegistryError::Database`] on query failure.
    #[instrument(skip(self, patch), fields(identity = %identity, source = %source))]
    pub async fn upsert(
        &self,
        identity: &str,
        source: &str,
        status_if_new: ItemStatus,
        patch: &ItemMetadata,
    ) -> Result<UpsertOutcome> {
        let url = canonicalize_url(identity)?;

        let mut initial = ItemMetadata::default();
        initial.merge(patch);

        let insert = sqlx::query(
            r"INSERT INTO items (
                url, source, status,
                title, authors, publication_date, abstract_text, subjects, doi,
                canonical_uri, pdf_url, snapshot_path, oai_identifier, publisher,
                language, resource_type
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(url) DO NOTHING
              RETURNING id",
        )
        .bind(&url)
        .bind(source)
        .bind(status_if_new.as_str());
        let inserted = bind_metadata(insert, &initial)
            .fetch_optional(self.db.pool())
            .await?;

        if let Some(row) = inserted {
            let id: i64 = row.get("id");
            debug!(item_id = id, status = %status_if_new, "registered new item");
            return Ok(UpsertOutcome {
                id,
                created: true,
                changed: true,
            });
        }

        for _ in 0..MAX_MERGE_ATTEMPTS {
            let item = self.fetch_by_url(&url).await?;
            let mut merged = item.metadata();
            if !merged.merge(patch) {
                return Ok(UpsertOutcome {
                    id: item.id,
                    created: false,
                    changed: false,
                });
            }
            if self.write_metadata(&item, &merged, None).await? {
                debug!(item_id = item.id, "merged metadata into existing item");
                return Ok(UpsertOutcome {
                    id: item.id,
                    created: false,
                    changed: true,
                });
            }
        }

        let item = self.fetch_by_url(&url).await?;
        Err(RegistryError::MergeContention {
            id: item.id,
            attempts: MAX_MERGE_ATTEMPTS,
        })
    }

    /// Returns items whose status is any of `statuses`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    #[instrument(skip(self, statuses), fields(status_count = statuses.len()))]
    pub async fn query(&self, statuses: &[ItemStatus], limit: usize) -> Result<Vec<Item>> {
        if statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql =
            format!("SELECT * FROM items WHERE status IN ({placeholders}) ORDER BY id LIMIT ?");
        let mut query = sqlx::query_as::<_, Item>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let items = query
            .bind(to_sql_limit(limit))
            .fetch_all(self.db.pool())
            .await?;
        Ok(items)
    }

    /// Moves an item from `expected` to `new`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TransitionConflict`] when the stored status is
    /// not `expected` at the moment of the update, or
    /// [`RegistryError::ItemNotFound`] for an unknown id.
    #[instrument(skip(self), fields(item_id = id, from = %expected, to = %new))]
    pub async fn transition(&self, id: i64, expected: ItemStatus, new: ItemStatus) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE items
              SET status = ?,
                  revision = revision + 1,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND status = ?",
        )
        .bind(new.as_str())
        .bind(id)
        .bind(expected.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_missed_update(id, expected).await);
        }
        Ok(())
    }

    /// Merges `patch` and moves the item from `expected` to `new` in one write.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::transition`], plus
    /// [`RegistryError::MergeContention`] under heavy concurrent writes.
    #[instrument(skip(self, patch), fields(item_id = id, from = %expected, to = %new))]
    pub async fn transition_with_patch(
        &self,
        id: i64,
        expected: ItemStatus,
        new: ItemStatus,
        patch: &ItemMetadata,
    ) -> Result<()> {
        for _ in 0..MAX_MERGE_ATTEMPTS {
            let item = self.get(id).await?.ok_or(RegistryError::ItemNotFound(id))?;
            if item.status() != expected {
                return Err(RegistryError::TransitionConflict {
                    id,
                    expected,
                    actual: item.status(),
                });
            }
            let mut merged = item.metadata();
            merged.merge(patch);
            if self
                .write_metadata(&item, &merged, Some((expected, new)))
                .await?
            {
                return Ok(());
            }
        }
        Err(RegistryError::MergeContention {
            id,
            attempts: MAX_MERGE_ATTEMPTS,
        })
    }

    /// Records a failed attempt at `stage`.
    ///
    /// Increments `error_count` and stores `message`. The item moves to the
    /// stage's error status, or to `failed_permanent` once `error_count`
    /// reaches `max_attempts`. Returns the status written.
    ///
    /// `error_count` is one budget for all stages and is never reset, so
    /// failures during extraction reduce the attempts left for download.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TransitionConflict`] if the item left
    /// `expected` in the meantime.
    #[instrument(skip(self, message), fields(item_id = id, stage = %stage))]
    pub async fn record_failure(
        &self,
        id: i64,
        expected: ItemStatus,
        stage: Stage,
        message: &str,
        max_attempts: u32,
    ) -> Result<ItemStatus> {
        let row: Option<(String,)> = sqlx::query_as(
            r"UPDATE items
              SET error_count = error_count + 1,
                  last_error = ?,
                  status = CASE WHEN error_count + 1 >= ? THEN ? ELSE ? END,
                  revision = revision + 1,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND status = ?
              RETURNING status",
        )
        .bind(message)
        .bind(i64::from(max_attempts))
        .bind(ItemStatus::FailedPermanent.as_str())
        .bind(stage.error_status().as_str())
        .bind(id)
        .bind(expected.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        let Some((status,)) = row else {
            return Err(self.explain_missed_update(id, expected).await);
        };
        let status = status.parse().unwrap_or(ItemStatus::FailedPermanent);
        if status == ItemStatus::FailedPermanent {
            warn!(item_id = id, stage = %stage, error = %message, "attempt bound exhausted");
        }
        Ok(status)
    }

    /// Moves an item straight to `failed_permanent`, recording `message`.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::transition`].
    #[instrument(skip(self, message), fields(item_id = id, from = %expected))]
    pub async fn fail_permanently(
        &self,
        id: i64,
        expected: ItemStatus,
        message: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE items
              SET status = ?,
                  last_error = ?,
                  revision = revision + 1,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND status = ?",
        )
        .bind(ItemStatus::FailedPermanent.as_str())
        .bind(message)
        .bind(id)
        .bind(expected.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_missed_update(id, expected).await);
        }
        Ok(())
    }

    /// Gets an item by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    pub async fn get(&self, id: i64) -> Result<Option<Item>> {
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(item)
    }

    /// Gets an item by identity (canonicalized before lookup).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidIdentity`] or [`RegistryError::Database`].
    pub async fn get_by_url(&self, identity: &str) -> Result<Option<Item>> {
        let url = canonicalize_url(identity)?;
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE url = ?")
            .bind(url)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(item)
    }

    /// Every item in insertion order. Used by report exports.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    pub async fn all_items(&self) -> Result<Vec<Item>> {
        let items = sqlx::query_as::<_, Item>("SELECT * FROM items ORDER BY id")
            .fetch_all(self.db.pool())
            .await?;
        Ok(items)
    }

    /// Item counts per status.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    pub async fn status_counts(&self) -> Result<Vec<(ItemStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM items GROUP BY status ORDER BY status")
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| status.parse().ok().map(|s| (s, count)))
            .collect())
    }

    // ==================== Resource ledger ====================

    /// Returns the ledger entry for `(item_id, url, kind)`, creating a
    /// pending one if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidIdentity`] or [`RegistryError::Database`].
    #[instrument(skip(self), fields(url = %url, kind = %kind))]
    pub async fn schedule_resource(
        &self,
        item_id: i64,
        url: &str,
        kind: ResourceKind,
    ) -> Result<Resource> {
        let url = canonicalize_url(url)?;
        sqlx::query(
            r"INSERT INTO resources (item_id, url, kind, status)
              VALUES (?, ?, ?, ?)
              ON CONFLICT(item_id, url, kind) DO NOTHING",
        )
        .bind(item_id)
        .bind(&url)
        .bind(kind.as_str())
        .bind(ResourceStatus::Pending.as_str())
        .execute(self.db.pool())
        .await?;

        let resource = sqlx::query_as::<_, Resource>(
            "SELECT * FROM resources WHERE item_id = ? AND url = ? AND kind = ?",
        )
        .bind(item_id)
        .bind(&url)
        .bind(kind.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(resource)
    }

    /// All ledger entries of an item in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    pub async fn resources_for_item(&self, item_id: i64) -> Result<Vec<Resource>> {
        let resources =
            sqlx::query_as::<_, Resource>("SELECT * FROM resources WHERE item_id = ? ORDER BY id")
                .bind(item_id)
                .fetch_all(self.db.pool())
                .await?;
        Ok(resources)
    }

    /// Marks a resource downloaded with its verified hash and size.
    ///
    /// `attempts` is added to the stored attempt count. An entry that is
    /// already `downloaded` is left untouched and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the update fails.
    #[instrument(skip(self, stored), fields(md5 = %stored.md5))]
    pub async fn record_download(
        &self,
        resource_id: i64,
        stored: &StoredFile,
        attempts: u32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE resources
              SET status = ?,
                  local_path = ?,
                  md5 = ?,
                  size_bytes = ?,
                  attempt_count = attempt_count + ?,
                  last_error = NULL,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND status != ?",
        )
        .bind(ResourceStatus::Downloaded.as_str())
        .bind(&stored.local_path)
        .bind(&stored.md5)
        .bind(i64::try_from(stored.size_bytes).unwrap_or(i64::MAX))
        .bind(i64::from(attempts))
        .bind(resource_id)
        .bind(ResourceStatus::Downloaded.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a failed transfer. Downloaded entries are never downgraded.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the update fails.
    #[instrument(skip(self, message), fields(status = %status))]
    pub async fn record_resource_failure(
        &self,
        resource_id: i64,
        status: ResourceStatus,
        attempts: u32,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"UPDATE resources
              SET status = ?,
                  attempt_count = attempt_count + ?,
                  last_error = ?,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND status != ?",
        )
        .bind(status.as_str())
        .bind(i64::from(attempts))
        .bind(message)
        .bind(resource_id)
        .bind(ResourceStatus::Downloaded.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resets a `downloaded` entry whose file has disappeared from disk.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn invalidate_download(&self, resource_id: i64) -> Result<()> {
        sqlx::query(
            r"UPDATE resources
              SET status = ?,
                  md5 = NULL,
                  size_bytes = NULL,
                  last_error = 'stored file missing',
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND status = ?",
        )
        .bind(ResourceStatus::Pending.as_str())
        .bind(resource_id)
        .bind(ResourceStatus::Downloaded.as_str())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Records (or refreshes) the HTML snapshot entry of an item.
    ///
    /// Snapshots are rewritten on every extraction, so unlike binaries their
    /// ledger entry follows the latest file.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidIdentity`] or [`RegistryError::Database`].
    #[instrument(skip(self, stored), fields(url = %url))]
    pub async fn record_snapshot(
        &self,
        item_id: i64,
        url: &str,
        stored: &StoredFile,
    ) -> Result<()> {
        let url = canonicalize_url(url)?;
        sqlx::query(
            r"INSERT INTO resources (
                item_id, url, kind, status, local_path, md5, size_bytes, attempt_count
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, 1)
              ON CONFLICT(item_id, url, kind) DO UPDATE SET
                status = excluded.status,
                local_path = excluded.local_path,
                md5 = excluded.md5,
                size_bytes = excluded.size_bytes,
                attempt_count = resources.attempt_count + 1,
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        )
        .bind(item_id)
        .bind(&url)
        .bind(ResourceKind::HtmlSnapshot.as_str())
        .bind(ResourceStatus::Downloaded.as_str())
        .bind(&stored.local_path)
        .bind(&stored.md5)
        .bind(i64::try_from(stored.size_bytes).unwrap_or(i64::MAX))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Downloaded resources of `kind` with their items, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if a query fails.
    pub async fn downloaded_resources(
        &self,
        kind: ResourceKind,
        limit: usize,
    ) -> Result<Vec<(Item, Resource)>> {
        let resources = sqlx::query_as::<_, Resource>(
            "SELECT * FROM resources WHERE kind = ? AND status = ? ORDER BY id LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(ResourceStatus::Downloaded.as_str())
        .bind(to_sql_limit(limit))
        .fetch_all(self.db.pool())
        .await?;

        let mut pairs = Vec::with_capacity(resources.len());
        for resource in resources {
            if let Some(item) = self.get(resource.item_id).await? {
                pairs.push((item, resource));
            }
        }
        Ok(pairs)
    }

    /// Resource counts per `(kind, status)`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Database`] if the query fails.
    pub async fn resource_counts(&self) -> Result<Vec<(ResourceKind, ResourceStatus, i64)>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT kind, status, COUNT(*) FROM resources GROUP BY kind, status ORDER BY kind, status",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(kind, status, count)| {
                Some((kind.parse().ok()?, status.parse().ok()?, count))
            })
            .collect())
    }

    // ==================== Internals ====================

    async fn fetch_by_url(&self, url: &str) -> Result<Item> {
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE url = ?")
            .bind(url)
            .fetch_one(self.db.pool())
            .await?;
        Ok(item)
    }

    /// Writes merged metadata guarded by the revision read alongside it, and
    /// optionally by a status transition. Returns false when the row moved on.
    async fn write_metadata(
        &self,
        item: &Item,
        metadata: &ItemMetadata,
        transition: Option<(ItemStatus, ItemStatus)>,
    ) -> Result<bool> {
        let (expected, new) = transition.unwrap_or((item.status(), item.status()));
        let update = sqlx::query(
            r"UPDATE items
              SET title = ?, authors = ?, publication_date = ?, abstract_text = ?,
                  subjects = ?, doi = ?, canonical_uri = ?, pdf_url = ?,
                  snapshot_path = ?, oai_identifier = ?, publisher = ?, language = ?,
                  resource_type = ?,
                  status = ?,
                  revision = revision + 1,
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ? AND revision = ? AND status = ?",
        );
        let result = bind_metadata(update, metadata)
            .bind(new.as_str())
            .bind(item.id)
            .bind(item.revision)
            .bind(expected.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Builds the error for a guarded update that touched no row.
    async fn explain_missed_update(&self, id: i64, expected: ItemStatus) -> RegistryError {
        match self.get(id).await {
            Ok(Some(item)) => {
                debug!(
                    item_id = id,
                    expected = %expected,
                    actual = %item.status(),
                    "status guard rejected update"
                );
                RegistryError::TransitionConflict {
                    id,
                    expected,
                    actual: item.status(),
                }
            }
            Ok(None) => RegistryError::ItemNotFound(id),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn registry() -> Registry {
        Registry::new(Database::new_in_memory().await.unwrap())
    }

    fn titled(title: &str) -> ItemMetadata {
        ItemMetadata {
            title: Some(title.to_string()),
            ..ItemMetadata::default()
        }
    }

    // ==================== Identity Tests ====================

    #[test]
    fn test_canonicalize_lowercases_host_and_drops_fragment() {
        let url = canonicalize_url("  HTTPS://Repo.Example.ORG/handle/1/2#top ").unwrap();
        assert_eq!(url, "https://repo.example.org/handle/1/2");
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert!(canonicalize_url("oai:repo:123").is_err());
        assert!(canonicalize_url("ftp://repo.example/file.pdf").is_err());
        assert!(canonicalize_url("/handle/1/2").is_err());
    }

    // ==================== Upsert Tests ====================

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let registry = registry().await;
        let url = "https://repo.example/handle/1/10";

        let first = registry
            .upsert(url, "oai", ItemStatus::PdfLinkPending, &titled("Rice blast"))
            .await
            .unwrap();
        assert!(first.created);

        let patch = ItemMetadata {
            doi: Some("10.1000/rice".to_string()),
            ..ItemMetadata::default()
        };
        let second = registry
            .upsert(url, "search", ItemStatus::HtmlPending, &patch)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.created);
        assert!(second.changed);

        let item = registry.get(first.id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::PdfLinkPending, "status kept");
        assert_eq!(item.source, "oai");
        let metadata = item.metadata();
        assert_eq!(metadata.title.as_deref(), Some("Rice blast"));
        assert_eq!(metadata.doi.as_deref(), Some("10.1000/rice"));
    }

    #[tokio::test]
    async fn test_upsert_identical_input_is_idempotent() {
        let registry = registry().await;
        let url = "https://repo.example/handle/1/11";
        let patch = titled("Cassava");

        let first = registry
            .upsert(url, "oai", ItemStatus::PdfLinkPending, &patch)
            .await
            .unwrap();
        let before = registry.get(first.id).await.unwrap().unwrap();

        let again = registry
            .upsert(url, "oai", ItemStatus::PdfLinkPending, &patch)
            .await
            .unwrap();
        let after = registry.get(first.id).await.unwrap().unwrap();

        assert!(!again.changed);
        assert_eq!(before.revision, after.revision);
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(registry.all_items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_same_identity_different_spelling_merges() {
        let registry = registry().await;
        registry
            .upsert(
                "https://REPO.example/handle/1/12",
                "oai",
                ItemStatus::PdfLinkPending,
                &ItemMetadata::default(),
            )
            .await
            .unwrap();
        let outcome = registry
            .upsert(
                "https://repo.example/handle/1/12#abstract",
                "search",
                ItemStatus::HtmlPending,
                &ItemMetadata::default(),
            )
            .await
            .unwrap();
        assert!(!outcome.created);
    }

    // ==================== Query Tests ====================

    #[tokio::test]
    async fn test_query_filters_by_status_in_insertion_order() {
        let registry = registry().await;
        for (n, status) in [
            ItemStatus::HtmlPending,
            ItemStatus::AwaitingDownload,
            ItemStatus::PdfLinkPending,
            ItemStatus::HtmlPending,
        ]
        .into_iter()
        .enumerate()
        {
            registry
                .upsert(
                    &format!("https://repo.example/handle/2/{n}"),
                    "test",
                    status,
                    &ItemMetadata::default(),
                )
                .await
                .unwrap();
        }

        let items = registry
            .query(&[ItemStatus::HtmlPending, ItemStatus::PdfLinkPending], 10)
            .await
            .unwrap();
        let urls: Vec<_> = items.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://repo.example/handle/2/0",
                "https://repo.example/handle/2/2",
                "https://repo.example/handle/2/3",
            ]
        );

        let limited = registry.query(&[ItemStatus::HtmlPending], 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(registry.query(&[], 10).await.unwrap().is_empty());
    }

    // ==================== Transition Tests ====================

    #[tokio::test]
    async fn test_transition_guarded_by_expected_status() {
        let registry = registry().await;
        let id = registry
            .upsert(
                "https://repo.example/handle/3/1",
                "test",
                ItemStatus::AwaitingDownload,
                &ItemMetadata::default(),
            )
            .await
            .unwrap()
            .id;

        registry
            .transition(id, ItemStatus::AwaitingDownload, ItemStatus::Processed)
            .await
            .unwrap();

        let err = registry
            .transition(id, ItemStatus::AwaitingDownload, ItemStatus::Processed)
            .await
            .unwrap_err();
        match err {
            RegistryError::TransitionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, ItemStatus::AwaitingDownload);
                assert_eq!(actual, ItemStatus::Processed);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transition_unknown_item() {
        let registry = registry().await;
        let err = registry
            .transition(999, ItemStatus::HtmlPending, ItemStatus::HtmlProcessed)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ItemNotFound(999)));
    }

    #[tokio::test]
    async fn test_transition_with_patch_updates_both() {
        let registry = registry().await;
        let id = registry
            .upsert(
                "https://repo.example/handle/3/2",
                "test",
                ItemStatus::HtmlPending,
                &ItemMetadata::default(),
            )
            .await
            .unwrap()
            .id;

        registry
            .transition_with_patch(
                id,
                ItemStatus::HtmlPending,
                ItemStatus::HtmlProcessed,
                &titled("Wheat rust"),
            )
            .await
            .unwrap();

        let item = registry.get(id).await.unwrap().unwrap();
        assert_eq!(item.status(), ItemStatus::HtmlProcessed);
        assert_eq!(item.title.as_deref(), Some("Wheat rust"));

        let err = registry
            .transition_with_patch(
                id,
                ItemStatus::HtmlPending,
                ItemStatus::HtmlProcessed,
                &titled("Other"),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let item = registry.get(id).await.unwrap().unwrap();
        assert_eq!(item.title.as_deref(), Some("Wheat rust"), "loser wrote nothing");
    }

    #[tokio::test]
    async fn test_record_failure_escalates_at_bound() {
        let registry = registry().await;
        let id = registry
            .upsert(
                "https://repo.example/handle/3/3",
                "test",
                ItemStatus::HtmlPending,
                &ItemMetadata::default(),
            )
            .await
            .unwrap()
            .id;

        let status = registry
            .record_failure(id, ItemStatus::HtmlPending, Stage::Extraction, "boom", 2)
            .await
            .unwrap();
        assert_eq!(status, ItemStatus::ErrorHtml);

        let status = registry
            .record_failure(id, ItemStatus::ErrorHtml, Stage::Extraction, "boom again", 2)
            .await
            .unwrap();
        assert_eq!(status, ItemStatus::FailedPermanent);

        let item = registry.get(id).await.unwrap().unwrap();
        assert_eq!(item.error_count, 2);
        assert_eq!(item.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_failure_budget_is_shared_across_stages() {
        let registry = registry().await;
        let id = registry
            .upsert(
                "https://repo.example/handle/3/4",
                "test",
                ItemStatus::HtmlPending,
                &ItemMetadata::default(),
            )
            .await
            .unwrap()
            .id;

        for expected in [ItemStatus::HtmlPending, ItemStatus::ErrorHtml] {
            let status = registry
                .record_failure(id, expected, Stage::Extraction, "page timeout", 3)
                .await
                .unwrap();
            assert_eq!(status, ItemStatus::ErrorHtml);
        }
        registry
            .transition(id, ItemStatus::ErrorHtml, ItemStatus::AwaitingDownload)
            .await
            .unwrap();

        // Two extraction failures leave one attempt for the download stage.
        let status = registry
            .record_failure(id, ItemStatus::AwaitingDownload, Stage::Download, "503", 3)
            .await
            .unwrap();
        assert_eq!(status, ItemStatus::FailedPermanent);
        assert_eq!(registry.get(id).await.unwrap().unwrap().error_count, 3);
    }

    // ==================== Ledger Tests ====================

    #[tokio::test]
    async fn test_schedule_resource_is_idempotent() {
        let registry = registry().await;
        let id = registry
            .upsert(
                "https://repo.example/handle/4/1",
                "test",
                ItemStatus::AwaitingDownload,
                &ItemMetadata::default(),
            )
            .await
            .unwrap()
            .id;

        let first = registry
            .schedule_resource(id, "https://repo.example/bitstream/4/1/a.pdf", ResourceKind::Pdf)
            .await
            .unwrap();
        let second = registry
            .schedule_resource(id, "https://REPO.example/bitstream/4/1/a.pdf", ResourceKind::Pdf)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status(), ResourceStatus::Pending);
        assert_eq!(registry.resources_for_item(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_downloaded_resource_is_immutable() {
        let registry = registry().await;
        let id = registry
            .upsert(
                "https://repo.example/handle/4/2",
                "test",
                ItemStatus::AwaitingDownload,
                &ItemMetadata::default(),
            )
            .await
            .unwrap()
            .id;
        let resource = registry
            .schedule_resource(id, "https://repo.example/b.pdf", ResourceKind::Pdf)
            .await
            .unwrap();
        let stored = StoredFile {
            local_path: "/tmp/b.pdf".to_string(),
            md5: "abc".to_string(),
            size_bytes: 3,
        };

        assert!(registry.record_download(resource.id, &stored, 2).await.unwrap());
        assert!(
            !registry
                .record_resource_failure(resource.id, ResourceStatus::FailedPermanent, 1, "late")
                .await
                .unwrap()
        );
        let again = StoredFile {
            md5: "def".to_string(),
            ..stored.clone()
        };
        assert!(!registry.record_download(resource.id, &again, 1).await.unwrap());

        let resources = registry.resources_for_item(id).await.unwrap();
        assert_eq!(resources[0].md5.as_deref(), Some("abc"));
        assert_eq!(resources[0].attempt_count, 2);
        assert!(resources[0].is_verified());
    }

    #[tokio::test]
    async fn test_record_snapshot_refreshes_entry() {
        let registry = registry().await;
        let url = "https://repo.example/handle/4/3";
        let id = registry
            .upsert(url, "test", ItemStatus::HtmlPending, &ItemMetadata::default())
            .await
            .unwrap()
            .id;

        for md5 in ["one", "two"] {
            registry
                .record_snapshot(
                    id,
                    url,
                    &StoredFile {
                        local_path: "/tmp/3.html".to_string(),
                        md5: md5.to_string(),
                        size_bytes: 10,
                    },
                )
                .await
                .unwrap();
        }

        let resources = registry.resources_for_item(id).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind(), ResourceKind::HtmlSnapshot);
        assert_eq!(resources[0].md5.as_deref(), Some("two"));
        assert_eq!(resources[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_pdf_at_item_url_is_separate_from_snapshot() {
        let registry = registry().await;
        let url = "https://repo.example/bitstream/4/4/report.pdf";
        let id = registry
            .upsert(url, "test", ItemStatus::HtmlPending, &ItemMetadata::default())
            .await
            .unwrap()
            .id;
        let snapshot = StoredFile {
            local_path: "/tmp/4.html".to_string(),
            md5: "html".to_string(),
            size_bytes: 10,
        };
        registry.record_snapshot(id, url, &snapshot).await.unwrap();

        let pdf = registry
            .schedule_resource(id, url, ResourceKind::Pdf)
            .await
            .unwrap();
        assert_eq!(pdf.kind(), ResourceKind::Pdf);
        assert_eq!(pdf.status(), ResourceStatus::Pending);
        assert!(pdf.md5.is_none());

        registry.record_snapshot(id, url, &snapshot).await.unwrap();
        let resources = registry.resources_for_item(id).await.unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].kind(), ResourceKind::HtmlSnapshot);
        assert_eq!(resources[0].attempt_count, 2);
        assert_eq!(resources[1].id, pdf.id);
        assert_eq!(resources[1].status(), ResourceStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let registry = registry().await;
        for n in 0..3 {
            registry
                .upsert(
                    &format!("https://repo.example/handle/5/{n}"),
                    "test",
                    if n == 0 {
                        ItemStatus::Processed
                    } else {
                        ItemStatus::HtmlPending
                    },
                    &ItemMetadata::default(),
                )
                .await
                .unwrap();
        }

        let counts = registry.status_counts().await.unwrap();
        assert!(counts.contains(&(ItemStatus::HtmlPending, 2)));
        assert!(counts.contains(&(ItemStatus::Processed, 1)));
    }
}
