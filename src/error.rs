//! Error taxonomy shared by the sync engine.
//!
//! The split mirrors how far an error is allowed to travel:
//! * [`SourceError`] comes back from a catalog call. Throttling is a pacing signal, not a
//!   failure; `Unavailable` is retried within a budget; `NotFound` is final for that record.
//! * [`StoreError`] comes back from the store. Only `Unavailable` (connectivity loss) may end
//!   a run; constraint and transaction errors stay inside the record or step that raised them.
//! * [`SyncError`] is the classification a run reports in its summary: why collection or a
//!   migration step stopped early, and why a run aborted.
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("throttled by catalog (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
    #[error("record not found in catalog")]
    NotFound,
    #[error("catalog payload could not be decoded: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Throttled { .. })
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection lost, pool exhausted or closed. Fatal to the whole run.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A row violated a constraint; scoped to the record being written.
    #[error("constraint violation: {0}")]
    Constraint(String),
    /// Any other failure inside a transaction; scoped to the enclosing atomic step.
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db_err) => {
                // SQLSTATE class 23: integrity constraint violation
                let is_constraint = db_err
                    .code()
                    .map(|code| code.starts_with("23"))
                    .unwrap_or(false);
                if is_constraint {
                    StoreError::Constraint(db_err.message().to_string())
                } else {
                    StoreError::Transaction(db_err.message().to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Decode(err.to_string())
            }
            _ => StoreError::Transaction(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

/// A record failed validation before any write was attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("invalid record: {0}")]
pub struct ValidationError(pub String);

/// Run-level classification of everything above.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncError {
    #[error("throttled (retry after {0:?})")]
    Throttled(Option<Duration>),
    #[error("transient source error: {0}")]
    TransientSource(String),
    /// The catalog answered but the answer is unusable; retrying will not help.
    #[error("source error: {0}")]
    Source(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("cursor error: {0}")]
    Cursor(String),
    #[error("transaction error: {0}")]
    Transaction(String),
    #[error("fatal store error: {0}")]
    FatalStore(String),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::FatalStore(_))
    }

    /// Whether the same work is likely to succeed on a later run without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Throttled(_) | SyncError::TransientSource(_))
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Throttled { retry_after } => SyncError::Throttled(retry_after),
            other if other.is_transient() => SyncError::TransientSource(other.to_string()),
            other => SyncError::Source(other.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        if err.is_fatal() {
            SyncError::FatalStore(err.to_string())
        } else {
            SyncError::Transaction(err.to_string())
        }
    }
}
