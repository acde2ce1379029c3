//! Error types for registry operations.

use std::fmt;

use thiserror::Error;

use super::ItemStatus;

/// Structured classification for registry database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl DbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> DbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return DbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_foreign_key_violation()
        || database_error.is_check_violation()
    {
        return DbErrorKind::ConstraintViolation;
    }

    if database_error
        .message()
        .to_ascii_lowercase()
        .contains("database is locked")
    {
        return DbErrorKind::BusyOrLocked;
    }

    DbErrorKind::Other
}

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        kind: DbErrorKind,
        message: String,
    },

    /// No item with this id.
    #[error("item not found: id {0}")]
    ItemNotFound(i64),

    /// No resource with this id.
    #[error("resource not found: id {0}")]
    ResourceNotFound(i64),

    /// The identity could not be normalized to a canonical URL.
    #[error("invalid item identity '{0}': not an absolute http(s) URL")]
    InvalidIdentity(String),

    /// The stored status no longer matches what the caller expected.
    ///
    /// Another worker got there first; the caller should re-read and move on.
    #[error("transition conflict on item {id}: expected {expected}, found {actual}")]
    TransitionConflict {
        id: i64,
        expected: ItemStatus,
        actual: ItemStatus,
    },

    /// Concurrent writers kept changing the row during a metadata merge.
    #[error("item {id} changed concurrently {attempts} times during merge")]
    MergeContention { id: i64, attempts: u32 },
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl RegistryError {
    /// Returns true for optimistic-concurrency losses that callers swallow.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::TransitionConflict { .. } | Self::MergeContention { .. }
        )
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
