//! Applies fetched catalog items to the store, one transaction per record.
//!
//! A record that fails validation or violates a constraint is tallied and the batch moves
//! on. Only a lost store connection stops the batch, and the partial tally travels with the
//! error so nothing already committed goes unreported.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::database_ops::store::{Location, Store, StoredGame};
use crate::error::{StoreError, ValidationError};
use crate::model::{
    CatalogItem, FailureReason, GameRecord, LifecycleState, RecordFailure, ReviewSummary, Tag,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconciliationResult {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<RecordFailure>,
}

impl ReconciliationResult {
    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.failed + self.skipped
    }

    /// Records that ended in a consistent stored state, including unchanged ones.
    pub fn succeeded(&self) -> usize {
        self.inserted + self.updated + self.skipped
    }

    pub fn record_failure(&mut self, failure: RecordFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: ReconciliationResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReconcileError {
    #[error("store unavailable during reconciliation: {message}")]
    StoreUnavailable {
        partial: ReconciliationResult,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Inserted,
    Updated,
    Unchanged,
    Skipped,
}

pub struct BatchReconciler {
    store: Arc<dyn Store>,
}

impl BatchReconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn apply(
        &self,
        items: &[CatalogItem],
    ) -> Result<ReconciliationResult, ReconcileError> {
        let mut result = ReconciliationResult::default();
        for item in items {
            if let Err(err) = validate(item) {
                warn!(key = %item.key, error = %err, "record failed validation");
                result.record_failure(RecordFailure::new(
                    item.key.clone(),
                    FailureReason::Validation(err.0),
                ));
                continue;
            }
            match self.apply_one(item, Utc::now()).await {
                Ok(Applied::Inserted) => result.inserted += 1,
                Ok(Applied::Updated) => result.updated += 1,
                Ok(Applied::Unchanged) | Ok(Applied::Skipped) => result.skipped += 1,
                Err(err) if err.is_fatal() => {
                    return Err(ReconcileError::StoreUnavailable {
                        partial: result,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(key = %item.key, error = %err, "record not applied");
                    result.record_failure(RecordFailure::new(item.key.clone(), store_failure(&err)));
                }
            }
        }
        debug!(
            inserted = result.inserted,
            updated = result.updated,
            failed = result.failed,
            skipped = result.skipped,
            "batch reconciled"
        );
        Ok(result)
    }

    async fn apply_one(
        &self,
        item: &CatalogItem,
        checked_at: DateTime<Utc>,
    ) -> Result<Applied, StoreError> {
        if !item.is_game() {
            debug!(key = %item.key, kind = ?item.payload.kind, "skipping non-game item");
            return Ok(Applied::Skipped);
        }
        match self.store.locate(&item.key).await? {
            Location::Staging => {
                debug!(key = %item.key, "record is mid-migration; leaving it to the migrator");
                Ok(Applied::Skipped)
            }
            Location::Absent => {
                let record = GameRecord::from_item(item, item.lifecycle_state(), checked_at);
                write_record(self.store.as_ref(), &record, item.tags.as_deref(), item.reviews.as_ref(), false)
                    .await?;
                Ok(Applied::Inserted)
            }
            Location::Main(stored) => {
                let state = match stored.record.state {
                    LifecycleState::Retired => LifecycleState::Retired,
                    _ => item.lifecycle_state(),
                };
                let record = GameRecord::from_item(item, state, checked_at);
                let changed = changed_fields(&stored, &record, item);
                if changed.is_empty() {
                    return Ok(Applied::Unchanged);
                }
                debug!(key = %item.key, ?changed, "updating record");
                let tags = item.tags.as_deref().filter(|_| changed.contains(&"tags"));
                let reviews = item.reviews.as_ref().filter(|_| changed.contains(&"reviews"));
                write_record(self.store.as_ref(), &record, tags, reviews, false).await?;
                Ok(Applied::Updated)
            }
        }
    }
}

fn validate(item: &CatalogItem) -> Result<(), ValidationError> {
    if item.key.external_id.trim().is_empty() {
        return Err(ValidationError("missing identifier".into()));
    }
    if item.payload.name.trim().is_empty() {
        return Err(ValidationError("missing name".into()));
    }
    Ok(())
}

/// Fields of `stored` that differ from the incoming record. Nested data only counts when the
/// item actually carries it.
fn changed_fields(stored: &StoredGame, incoming: &GameRecord, item: &CatalogItem) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if stored.record.state != incoming.state {
        changed.push("state");
    }
    if stored.record.payload != incoming.payload {
        changed.push("payload");
    }
    if stored.record.release_date != incoming.release_date {
        changed.push("release_date");
    }
    if let Some(tags) = &item.tags {
        if !same_tags(&stored.tags, tags) {
            changed.push("tags");
        }
    }
    if let Some(reviews) = &item.reviews {
        if stored.reviews.as_ref() != Some(reviews) {
            changed.push("reviews");
        }
    }
    changed
}

fn same_tags(stored: &[Tag], incoming: &[Tag]) -> bool {
    let mut a: Vec<&Tag> = stored.iter().collect();
    let mut b: Vec<&Tag> = incoming.iter().collect();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

pub(crate) fn store_failure(err: &StoreError) -> FailureReason {
    match err {
        StoreError::Constraint(msg) => FailureReason::Constraint(msg.clone()),
        other => FailureReason::Transaction(other.to_string()),
    }
}

/// Write one record and its nested data in a single transaction, appending a price-history
/// row when the record carries a price. With `unstage` the record's staging row is deleted
/// in the same transaction and must exist.
pub(crate) async fn write_record(
    store: &dyn Store,
    record: &GameRecord,
    tags: Option<&[Tag]>,
    reviews: Option<&ReviewSummary>,
    unstage: bool,
) -> Result<(), StoreError> {
    let mut tx = store.begin().await?;
    let applied: Result<(), StoreError> = async {
        tx.upsert_record(record).await?;
        if let Some(tags) = tags {
            tx.replace_nested(&record.key, tags).await?;
        }
        if let Some(reviews) = reviews {
            tx.replace_reviews(&record.key, reviews).await?;
        }
        if let Some(price) = &record.payload.price {
            tx.append_price(&record.key, price, record.last_checked).await?;
        }
        if unstage && !tx.delete_from_staging(&record.key).await? {
            return Err(StoreError::Transaction(format!(
                "{} vanished from staging",
                record.key
            )));
        }
        Ok(())
    }
    .await;
    match applied {
        Ok(()) => tx.commit().await,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(key = %record.key, error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
