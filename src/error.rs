//! Error types

use thiserror::Error;

/// Failure reported by a shard's storage engine, classified once at the
/// storage boundary so callers branch on kinds instead of message text.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table does not exist")]
    TableMissing,

    #[error("table already exists")]
    TableExists,

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // SQLite reports both conditions as SQLITE_ERROR; only the
            // message tells them apart.
            let message = db.message();
            if message.starts_with("no such table") {
                return StoreError::TableMissing;
            }
            if message.starts_with("table") && message.ends_with("already exists") {
                return StoreError::TableExists;
            }
        }
        StoreError::Database(err)
    }
}

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("invalid day '{0}': expected YYYYMMDD")]
    InvalidDay(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid request id '{0}'")]
    InvalidRequestId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("directory lookup failed: {0}")]
    Directory(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("log record serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

impl LogStoreError {
    /// True for errors caused by the caller's input rather than by a shard.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LogStoreError::InvalidDay(_)
                | LogStoreError::InvalidFilter(_)
                | LogStoreError::InvalidRequestId(_)
        )
    }
}

impl LogStoreError {
    pub(crate) fn directory(err: anyhow::Error) -> Self {
        LogStoreError::Directory(err.into())
    }
}

impl From<sqlx::Error> for LogStoreError {
    fn from(err: sqlx::Error) -> Self {
        LogStoreError::Store(err.into())
    }
}

pub type Result<T, E = LogStoreError> = std::result::Result<T, E>;
