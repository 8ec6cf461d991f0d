//! Storage capability used by the sync engine.
//!
//! Reads happen directly on [`Store`]; every mutation goes through a [`StoreTx`] so the
//! engine decides the atomic boundaries: one transaction for the whole move into staging,
//! one per record for every write back.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::model::{
    FailureReason, GameRecord, LifecycleState, Price, RecordKey, ReviewSummary, Source, Tag,
};
use crate::sync::staleness::StalenessPredicate;

/// A main-relation row together with its nested data.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredGame {
    pub record: GameRecord,
    pub tags: Vec<Tag>,
    pub reviews: Option<ReviewSummary>,
}

/// Where a key currently lives. A key is never in both relations.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    Absent,
    Main(Box<StoredGame>),
    Staging,
}

/// Staging-relation row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedRecord {
    pub record: GameRecord,
    /// State the record held in the main relation before it was staged.
    pub previous_state: LifecycleState,
    pub staged_at: DateTime<Utc>,
    /// Set once refetching gave up; the row is kept for inspection.
    pub failure_reason: Option<String>,
}

impl StagedRecord {
    pub fn is_failed(&self) -> bool {
        self.failure_reason.is_some()
    }
}

/// One price-history row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePoint {
    pub price: Price,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn locate(&self, key: &RecordKey) -> Result<Location, StoreError>;

    /// Keys in `state` whose `last_checked` satisfies the staleness predicate, oldest first.
    async fn select_by_state(
        &self,
        source: Source,
        state: LifecycleState,
        staleness: &StalenessPredicate,
        limit: usize,
    ) -> Result<Vec<RecordKey>, StoreError>;

    /// Active keys whose parsed release date is on or after `since`, newest first.
    async fn select_recent_releases(
        &self,
        source: Source,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RecordKey>, StoreError>;

    async fn staged_records(&self, source: Source) -> Result<Vec<StagedRecord>, StoreError>;

    async fn staging_is_empty(&self) -> Result<bool, StoreError>;

    /// Record that refetching gave up on a staged row. The row itself stays put.
    async fn mark_staging_failed(
        &self,
        key: &RecordKey,
        reason: &FailureReason,
    ) -> Result<(), StoreError>;

    /// Highest identifier stored for `source` (numeric identifiers compare numerically).
    async fn max_external_id(&self, source: Source) -> Result<Option<String>, StoreError>;
}

/// One open transaction. Dropping it without `commit` discards every change.
#[async_trait]
pub trait StoreTx: Send {
    /// Copy each key's main row into staging and delete it from main. Fails unless every
    /// key was present in main.
    async fn move_to_staging(&mut self, keys: &[RecordKey]) -> Result<usize, StoreError>;

    async fn upsert_record(&mut self, record: &GameRecord) -> Result<(), StoreError>;

    /// Replace all tags of `key` with `tags`.
    async fn replace_nested(&mut self, key: &RecordKey, tags: &[Tag]) -> Result<(), StoreError>;

    async fn replace_reviews(
        &mut self,
        key: &RecordKey,
        reviews: &ReviewSummary,
    ) -> Result<(), StoreError>;

    /// Append a price observation for `key`; earlier rows are kept.
    async fn append_price(
        &mut self,
        key: &RecordKey,
        price: &Price,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns whether a staging row was deleted.
    async fn delete_from_staging(&mut self, key: &RecordKey) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Ordering used for "highest identifier": numeric ids by value, then everything else
/// lexicographically after them.
pub(crate) fn external_id_order(id: &str) -> (bool, usize, &str) {
    let numeric = !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit());
    let trimmed = if numeric { id.trim_start_matches('0') } else { id };
    (!numeric, trimmed.len(), trimmed)
}
