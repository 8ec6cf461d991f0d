//! Pending-release records are refreshed by moving them out of the main relation, refetching
//! them, and writing them back one at a time.
//!
//! ```text
//! Selecting -> Moved -> Refetching -> Reinserted
//!                                  \-> Failed (kept in staging)
//! ```
//!
//! The move is a single transaction for the whole candidate set; each write back is its own
//! transaction that also deletes the staging row, so a key is never in both relations.
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database_ops::catalog::CatalogSource;
use crate::database_ops::store::{StagedRecord, Store};
use crate::error::{StoreError, SyncError};
use crate::model::{
    CatalogItem, FailureReason, GameRecord, LifecycleState, RecordFailure, RecordKey,
};
use crate::sync::collector::failure_reason;
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::reconciler::{store_failure, write_record};
use crate::sync::retry::{call_with_retry, RetryPolicy};
use crate::sync::staleness::StalenessWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Selecting,
    Moved,
    Refetching,
    Reinserted,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Selecting => "selecting",
            MigrationState::Moved => "moved",
            MigrationState::Refetching => "refetching",
            MigrationState::Reinserted => "reinserted",
            MigrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordOutcome {
    pub key: RecordKey,
    pub state: MigrationState,
    /// Lifecycle state written back to the main relation.
    pub reinserted_as: Option<LifecycleState>,
    pub reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    pub selected: usize,
    pub moved: usize,
    /// Staged rows left behind by an earlier run and picked up by this one.
    pub recovered: usize,
    pub reinserted: usize,
    pub failures: Vec<RecordFailure>,
    pub outcomes: Vec<RecordOutcome>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.selected == 0 && self.recovered == 0 && self.outcomes.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn fail(&mut self, key: RecordKey, reason: FailureReason) {
        transition(&key, MigrationState::Refetching, MigrationState::Failed);
        self.failures.push(RecordFailure::new(key.clone(), reason.clone()));
        self.outcomes.push(RecordOutcome {
            key,
            state: MigrationState::Failed,
            reinserted_as: None,
            reason: Some(reason),
        });
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MigrationError {
    /// Selecting or moving the candidates failed; nothing was changed.
    #[error("migration step aborted: {0}")]
    Transaction(StoreError),
    #[error("store unavailable during migration: {message}")]
    StoreUnavailable {
        partial: MigrationReport,
        message: String,
    },
}

impl From<MigrationError> for SyncError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Transaction(store) => SyncError::from(store),
            MigrationError::StoreUnavailable { message, .. } => SyncError::FatalStore(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOptions {
    pub staleness: StalenessWindow,
    pub limit: usize,
    /// Also retry rows an earlier run marked as failed.
    pub retry_failed: bool,
    pub fetch_nested: bool,
    pub retry: RetryPolicy,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            staleness: StalenessWindow::default(),
            limit: 1000,
            retry_failed: false,
            fetch_nested: true,
            retry: RetryPolicy::default(),
        }
    }
}

fn transition(key: &RecordKey, from: MigrationState, to: MigrationState) {
    debug!(key = %key, from = %from, to = %to, "staging transition");
}

pub struct StagingMigrator {
    store: Arc<dyn Store>,
    source: Arc<dyn CatalogSource>,
    limiter: RateLimiter,
    options: MigrationOptions,
}

impl StagingMigrator {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn CatalogSource>,
        limiter: RateLimiter,
        options: MigrationOptions,
    ) -> Self {
        Self {
            store,
            source,
            limiter,
            options,
        }
    }

    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        self.run_at(Utc::now()).await
    }

    /// Run one migration with the staleness window resolved against `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::default();
        let source = self.source.source();

        let predicate = self.options.staleness.predicate_at(now);
        let candidates = self
            .store
            .select_by_state(source, LifecycleState::PendingRelease, &predicate, self.options.limit)
            .await
            .map_err(|err| step_error(err, &report))?;
        report.selected = candidates.len();
        info!(
            source = %source,
            state = %MigrationState::Selecting,
            candidates = candidates.len(),
            cutoff = %predicate.cutoff(),
            "selected stale pending-release records"
        );

        if !candidates.is_empty() {
            let moved = self
                .move_candidates(&candidates)
                .await
                .map_err(|err| step_error(err, &report))?;
            report.moved = moved;
            for key in &candidates {
                transition(key, MigrationState::Selecting, MigrationState::Moved);
            }
            info!(source = %source, state = %MigrationState::Moved, moved = report.moved, "candidates moved to staging");
        }

        let staged = self
            .store
            .staged_records(source)
            .await
            .map_err(|err| step_error(err, &report))?;
        let work: Vec<StagedRecord> = staged
            .into_iter()
            .filter(|row| !row.is_failed() || self.options.retry_failed)
            .collect();
        report.recovered = work
            .iter()
            .filter(|row| !candidates.contains(&row.record.key))
            .count();
        if report.recovered > 0 {
            info!(source = %source, recovered = report.recovered, "resuming records left in staging");
        }
        if work.is_empty() {
            debug!(source = %source, "nothing to migrate");
            return Ok(report);
        }

        for row in work {
            self.process(row, now, &mut report).await?;
        }
        info!(
            source = %source,
            reinserted = report.reinserted,
            failed = report.failed(),
            "staging migration finished"
        );
        Ok(report)
    }

    async fn move_candidates(&self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        let mut tx = self.store.begin().await?;
        let moved = match tx.move_to_staging(keys).await {
            Ok(moved) if moved == keys.len() => moved,
            Ok(moved) => {
                tx.rollback().await?;
                return Err(StoreError::Transaction(format!(
                    "moved {moved} of {} candidates",
                    keys.len()
                )));
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback of staging move failed");
                }
                return Err(err);
            }
        };
        tx.commit().await?;
        Ok(moved)
    }

    async fn process(
        &self,
        row: StagedRecord,
        now: DateTime<Utc>,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let key = row.record.key.clone();
        transition(&key, MigrationState::Moved, MigrationState::Refetching);

        let item = match self.refetch(&key.external_id).await {
            Ok(item) => item,
            Err(reason) => {
                warn!(key = %key, reason = %reason, "refetch failed; keeping record in staging");
                self.mark_failed(&key, &reason, report).await?;
                report.fail(key, reason);
                return Ok(());
            }
        };

        if item.payload.name.trim().is_empty() {
            let reason = FailureReason::Validation("missing name".into());
            self.mark_failed(&key, &reason, report).await?;
            report.fail(key, reason);
            return Ok(());
        }

        let state = match row.previous_state {
            LifecycleState::Retired => LifecycleState::Retired,
            _ => item.lifecycle_state(),
        };
        let record = GameRecord::from_item(&item, state, now);
        match write_record(
            self.store.as_ref(),
            &record,
            item.tags.as_deref(),
            item.reviews.as_ref(),
            true,
        )
        .await
        {
            Ok(()) => {
                transition(&key, MigrationState::Refetching, MigrationState::Reinserted);
                info!(key = %key, state = %state, "record reinserted");
                report.reinserted += 1;
                report.outcomes.push(RecordOutcome {
                    key,
                    state: MigrationState::Reinserted,
                    reinserted_as: Some(state),
                    reason: None,
                });
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(MigrationError::StoreUnavailable {
                partial: report.clone(),
                message: err.to_string(),
            }),
            Err(err) => {
                warn!(key = %key, error = %err, "write back failed; keeping record in staging");
                let reason = store_failure(&err);
                self.mark_failed(&key, &reason, report).await?;
                report.fail(key, reason);
                Ok(())
            }
        }
    }

    async fn refetch(&self, id: &str) -> Result<CatalogItem, FailureReason> {
        let source = Arc::clone(&self.source);
        let mut item = call_with_retry(&self.limiter, &self.options.retry, "fetch_one", || {
            source.fetch_one(id)
        })
        .await
        .map_err(|err| failure_reason(&err))?;
        if self.options.fetch_nested && item.tags.is_none() {
            match call_with_retry(&self.limiter, &self.options.retry, "fetch_nested", || {
                source.fetch_nested(id)
            })
            .await
            {
                Ok(tags) => item.tags = Some(tags),
                Err(err) => warn!(id, error = %err, "tags unavailable; keeping stored tags"),
            }
        }
        Ok(item)
    }

    async fn mark_failed(
        &self,
        key: &RecordKey,
        reason: &FailureReason,
        report: &MigrationReport,
    ) -> Result<(), MigrationError> {
        match self.store.mark_staging_failed(key, reason).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(MigrationError::StoreUnavailable {
                partial: report.clone(),
                message: err.to_string(),
            }),
            Err(err) => {
                warn!(key = %key, error = %err, "could not record staging failure");
                Ok(())
            }
        }
    }
}

fn step_error(err: StoreError, report: &MigrationReport) -> MigrationError {
    if err.is_fatal() {
        MigrationError::StoreUnavailable {
            partial: report.clone(),
            message: err.to_string(),
        }
    } else {
        MigrationError::Transaction(err)
    }
}
