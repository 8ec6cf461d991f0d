//! One end-to-end sync run: collect and reconcile page by page, then migrate stale
//! pending-release records, then optionally refresh recent releases.
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::database_ops::catalog::{CatalogSource, PagingMode};
use crate::database_ops::store::Store;
use crate::error::SyncError;
use crate::model::{CollectionCursor, RecordFailure, Source};
use crate::sync::collector::PaginatedCollector;
use crate::sync::config::SyncConfig;
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::reconciler::{BatchReconciler, ReconcileError, ReconciliationResult};
use crate::sync::refresh::{RefreshError, ReviewRefresher};
use crate::sync::staging::{MigrationError, MigrationReport, StagingMigrator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// The store became unreachable; everything counted below was committed before that.
    Aborted { reason: SyncError },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub source: Source,
    pub start_cursor: CollectionCursor,
    pub last_confirmed_cursor: CollectionCursor,
    pub pages: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failures: Vec<RecordFailure>,
    /// Set when collection stopped early on a page that could not be fetched.
    pub collection_error: Option<SyncError>,
    pub migration: Option<MigrationReport>,
    pub migration_error: Option<SyncError>,
    pub refresh: Option<ReconciliationResult>,
    /// Set when the refresh step could not select its records.
    pub refresh_error: Option<SyncError>,
    pub outcome: RunOutcome,
}

impl RunSummary {
    fn new(source: Source, start_cursor: CollectionCursor) -> Self {
        Self {
            source,
            last_confirmed_cursor: start_cursor.clone(),
            start_cursor,
            pages: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            failures: Vec::new(),
            collection_error: None,
            migration: None,
            migration_error: None,
            refresh: None,
            refresh_error: None,
            outcome: RunOutcome::Completed,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Aborted { .. })
    }

    fn absorb(&mut self, result: &ReconciliationResult) {
        self.processed += result.processed();
        self.succeeded += result.succeeded();
        self.failed += result.failed;
        self.inserted += result.inserted;
        self.updated += result.updated;
        self.skipped += result.skipped;
        self.failures.extend(result.failures.iter().cloned());
    }

    fn absorb_migration(&mut self, report: &MigrationReport) {
        self.processed += report.outcomes.len();
        self.succeeded += report.reinserted;
        self.failed += report.failed();
        self.failures.extend(report.failures.iter().cloned());
    }

    fn abort(&mut self, reason: SyncError) {
        error!(reason = %reason, "run aborted: store unavailable");
        self.outcome = RunOutcome::Aborted { reason };
    }
}

/// Which steps a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub collect: bool,
    pub migrate: bool,
    pub refresh: bool,
}

impl Stages {
    pub const ALL: Stages = Stages {
        collect: true,
        migrate: true,
        refresh: true,
    };
    pub const COLLECT: Stages = Stages {
        collect: true,
        migrate: false,
        refresh: false,
    };
    pub const MIGRATE: Stages = Stages {
        collect: false,
        migrate: true,
        refresh: false,
    };
    pub const REFRESH: Stages = Stages {
        collect: false,
        migrate: false,
        refresh: true,
    };
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    source: Arc<dyn CatalogSource>,
    limiter: RateLimiter,
    config: SyncConfig,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn CatalogSource>, config: SyncConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit());
        Self {
            store,
            source,
            limiter,
            config,
        }
    }

    /// Collect, then migrate, then refresh recent releases when configured.
    pub async fn run(&self) -> RunSummary {
        let stages = Stages {
            refresh: self.config.refresh_reviews,
            ..Stages::ALL
        };
        self.run_stages(stages).await
    }

    pub async fn run_stages(&self, stages: Stages) -> RunSummary {
        let source = self.source.source();
        let mut summary = RunSummary::new(source, self.config.start_cursor.clone());

        if stages.collect {
            match self.resolve_start_cursor().await {
                Ok(start) => {
                    summary.start_cursor = start.clone();
                    summary.last_confirmed_cursor = start;
                }
                Err(reason) => {
                    summary.abort(reason);
                    return summary;
                }
            }
            self.collect(&mut summary).await;
            if summary.is_aborted() {
                return summary;
            }
        }

        if stages.migrate {
            let migrator = StagingMigrator::new(
                Arc::clone(&self.store),
                Arc::clone(&self.source),
                self.limiter.clone(),
                self.config.migration_options(),
            );
            match migrator.run().await {
                Ok(report) => {
                    summary.absorb_migration(&report);
                    summary.migration = Some(report);
                }
                Err(MigrationError::StoreUnavailable { partial, message }) => {
                    summary.absorb_migration(&partial);
                    summary.migration = Some(partial);
                    summary.abort(SyncError::FatalStore(message));
                    return summary;
                }
                Err(err @ MigrationError::Transaction(_)) => {
                    warn!(error = %err, "staging migration step aborted");
                    summary.migration_error = Some(SyncError::from(err));
                }
            }
        }

        if stages.refresh {
            let refresher = ReviewRefresher::new(
                Arc::clone(&self.store),
                Arc::clone(&self.source),
                self.limiter.clone(),
                self.config.refresh_options(),
            );
            match refresher.run().await {
                Ok(result) => {
                    summary.absorb(&result);
                    summary.refresh = Some(result);
                }
                Err(RefreshError::StoreUnavailable { partial, message }) => {
                    summary.absorb(&partial);
                    summary.refresh = Some(partial);
                    summary.abort(SyncError::FatalStore(message));
                    return summary;
                }
                Err(err @ RefreshError::Select(_)) => {
                    warn!(error = %err, "review refresh skipped");
                    summary.refresh_error = Some(SyncError::from(err));
                }
            }
        }

        info!(
            source = %source,
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            last_cursor = %summary.last_confirmed_cursor,
            "sync run finished"
        );
        summary
    }

    async fn resolve_start_cursor(&self) -> Result<CollectionCursor, SyncError> {
        if !self.config.resume_from_store {
            return Ok(self.config.start_cursor.clone());
        }
        if self.source.paging() != PagingMode::AfterId {
            warn!(
                source = %self.source.source(),
                "resume-from-store needs identifier paging; using configured start cursor"
            );
            return Ok(self.config.start_cursor.clone());
        }
        match self.store.max_external_id(self.source.source()).await {
            Ok(Some(id)) => {
                info!(after = %id, "resuming after highest stored identifier");
                Ok(CollectionCursor::After(id))
            }
            Ok(None) => Ok(self.config.start_cursor.clone()),
            Err(err) if err.is_fatal() => Err(SyncError::from(err)),
            Err(err) => {
                warn!(error = %err, "could not read highest stored identifier; using configured start cursor");
                Ok(self.config.start_cursor.clone())
            }
        }
    }

    async fn collect(&self, summary: &mut RunSummary) {
        let mut collector = PaginatedCollector::new(
            Arc::clone(&self.source),
            self.limiter.clone(),
            self.config.collector_options(),
            summary.start_cursor.clone(),
        );
        let reconciler = BatchReconciler::new(Arc::clone(&self.store));

        loop {
            let batch = match collector.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    let err = SyncError::from(err);
                    error!(
                        error = %err,
                        transient = err.is_transient(),
                        cursor = %collector.confirmed_cursor(),
                        "collection stopped"
                    );
                    summary.collection_error = Some(err);
                    break;
                }
            };
            summary.pages += 1;

            let mut result = ReconciliationResult::default();
            for failure in batch.unresolved.iter().cloned() {
                result.record_failure(failure);
            }
            match reconciler.apply(&batch.items).await {
                Ok(applied) => result.merge(applied),
                Err(ReconcileError::StoreUnavailable { partial, message }) => {
                    result.merge(partial);
                    summary.absorb(&result);
                    summary.abort(SyncError::FatalStore(message));
                    return;
                }
            }
            summary.absorb(&result);

            if let Err(err) = collector.confirm(&batch.cursor) {
                error!(error = %err, "cursor confirmation rejected");
                summary.collection_error = Some(SyncError::from(err));
                break;
            }
            summary.last_confirmed_cursor = batch.cursor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::store::StoredGame;
    use crate::error::SourceError;
    use crate::model::{GameRecord, LifecycleState, RecordKey};
    use crate::sync::testing::{game, ScriptedSource};
    use chrono::{Duration, Utc};
    use std::collections::BTreeSet;

    fn config(page_size: usize) -> SyncConfig {
        SyncConfig {
            page_size,
            fetch_nested: false,
            rate_limit_per_second: 0.0,
            max_retries: 1,
            retry_base_ms: 10,
            backoff_ceiling_ms: 100,
            ..SyncConfig::default()
        }
    }

    fn pipeline(store: &MemoryStore, source: Arc<ScriptedSource>, config: SyncConfig) -> Pipeline {
        Pipeline::new(Arc::new(store.clone()), source, config)
    }

    fn main_keys(store: &MemoryStore) -> BTreeSet<RecordKey> {
        store.snapshot().main.keys().cloned().collect()
    }

    #[tokio::test]
    async fn interrupted_then_resumed_matches_uninterrupted_run() {
        tokio::time::pause();
        let reference = MemoryStore::new();
        let full = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 7));
        let summary = pipeline(&reference, full, config(2)).run().await;
        assert_eq!(summary.inserted, 7);

        let store = MemoryStore::new();
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 7));
        source.fail_listing_at(
            CollectionCursor::Offset(4),
            vec![SourceError::Unavailable("gateway timeout".into()); 2],
        );
        let first = pipeline(&store, source.clone(), config(2)).run().await;
        assert_eq!(
            first.collection_error,
            Some(SyncError::TransientSource("catalog unavailable: gateway timeout".into()))
        );
        assert!(!first.is_aborted());
        assert_eq!(first.last_confirmed_cursor, CollectionCursor::Offset(4));

        let resumed = pipeline(
            &store,
            source,
            SyncConfig {
                start_cursor: first.last_confirmed_cursor.clone(),
                ..config(2)
            },
        )
        .run()
        .await;
        assert_eq!(resumed.inserted, 3);
        assert_eq!(main_keys(&store), main_keys(&reference));
        assert!(store.stats().inserts.values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn crash_before_confirm_refetches_without_duplicates() {
        let store = MemoryStore::new();
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 5));
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let limiter = RateLimiter::new(config(2).rate_limit());
        let mut collector = PaginatedCollector::new(
            source.clone(),
            limiter,
            config(2).collector_options(),
            CollectionCursor::Start,
        );
        let reconciler = BatchReconciler::new(Arc::clone(&shared));

        let page = collector.next_batch().await.unwrap().unwrap();
        reconciler.apply(&page.items).await.unwrap();
        collector.confirm(&page.cursor).unwrap();
        let resume_at = collector.confirmed_cursor().clone();
        let page = collector.next_batch().await.unwrap().unwrap();
        reconciler.apply(&page.items).await.unwrap();
        drop(collector); // crashed before confirming the second page

        let summary = pipeline(
            &store,
            source,
            SyncConfig {
                start_cursor: resume_at,
                ..config(2)
            },
        )
        .run()
        .await;
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(store.snapshot().main.len(), 5);
        assert!(store.stats().inserts.values().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn lost_store_aborts_and_keeps_confirmed_work() {
        let store = MemoryStore::new();
        store.lose_connection_after_commits(3);
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 6));

        let summary = pipeline(&store, source.clone(), config(2)).run().await;
        assert!(summary.is_aborted());
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.last_confirmed_cursor, CollectionCursor::Offset(2));
        assert!(summary.migration.is_none());

        store.set_unavailable(false);
        assert_eq!(store.snapshot().main.len(), 3);
        let resumed = pipeline(
            &store,
            source,
            SyncConfig {
                start_cursor: summary.last_confirmed_cursor.clone(),
                ..config(2)
            },
        )
        .run()
        .await;
        assert_eq!(resumed.outcome, RunOutcome::Completed);
        assert_eq!(resumed.inserted, 3);
        assert_eq!(resumed.skipped, 1);
        assert_eq!(store.snapshot().main.len(), 6);
    }

    #[tokio::test]
    async fn validation_failures_are_counted_and_reported() {
        let mut listing: Vec<_> = (1..=4).map(|i| game(Source::Nintendo, &i.to_string())).collect();
        listing[1].payload.name.clear();
        let store = MemoryStore::new();
        let source = Arc::new(ScriptedSource::new(Source::Nintendo, PagingMode::Offset, listing));

        let summary = pipeline(&store, source, config(10)).run().await;
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].key, RecordKey::new(Source::Nintendo, "2"));
        assert_eq!(summary.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn migration_runs_after_collection() {
        let store = MemoryStore::new();
        let mut upcoming = game(Source::Steam, "100");
        upcoming.payload.release.coming_soon = true;
        store.seed(StoredGame {
            record: GameRecord::from_item(
                &upcoming,
                LifecycleState::PendingRelease,
                Utc::now() - Duration::days(30),
            ),
            tags: vec![],
            reviews: None,
        });
        let mut listing: Vec<_> = (1..=2).map(|i| game(Source::Steam, &i.to_string())).collect();
        listing.push(game(Source::Steam, "100"));
        let source = Arc::new(ScriptedSource::new(Source::Steam, PagingMode::AfterId, listing));

        let summary = pipeline(
            &store,
            source,
            SyncConfig {
                max_items: Some(2),
                ..config(2)
            },
        )
        .run()
        .await;
        assert_eq!(summary.inserted, 2);
        let migration = summary.migration.as_ref().unwrap();
        assert_eq!(migration.reinserted, 1);
        assert_eq!(summary.processed, 3);
        let snap = store.snapshot();
        assert_eq!(
            snap.main[&RecordKey::new(Source::Steam, "100")].state,
            LifecycleState::Active
        );
        assert!(snap.staging.is_empty());
    }

    #[tokio::test]
    async fn failed_migration_step_is_reported_without_aborting() {
        let store = MemoryStore::new();
        let mut upcoming = game(Source::Steam, "100");
        upcoming.payload.release.coming_soon = true;
        store.seed(StoredGame {
            record: GameRecord::from_item(
                &upcoming,
                LifecycleState::PendingRelease,
                Utc::now() - Duration::days(30),
            ),
            tags: vec![],
            reviews: None,
        });
        store.fail_moves(true);
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 0));

        let summary = pipeline(&store, source, config(2)).run_stages(Stages::MIGRATE).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);
        let err = summary.migration_error.clone().unwrap();
        assert!(matches!(err, SyncError::Transaction(_)));
        assert!(!err.is_fatal());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["migration_error"]["kind"], "transaction");
        assert_eq!(
            store.snapshot().main[&RecordKey::new(Source::Steam, "100")].state,
            LifecycleState::PendingRelease
        );
    }

    #[tokio::test]
    async fn resume_from_store_starts_after_highest_identifier() {
        let store = MemoryStore::new();
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 6));
        pipeline(
            &store,
            source.clone(),
            SyncConfig {
                max_items: Some(3),
                ..config(3)
            },
        )
        .run_stages(Stages::COLLECT)
        .await;

        let summary = pipeline(
            &store,
            source,
            SyncConfig {
                resume_from_store: true,
                ..config(3)
            },
        )
        .run_stages(Stages::COLLECT)
        .await;
        assert_eq!(summary.start_cursor, CollectionCursor::After("3".into()));
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn summary_serializes_outcome_tag() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 2));
        let summary = pipeline(&store, source, config(2)).run().await;
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outcome"]["status"], "aborted");
        assert_eq!(json["outcome"]["reason"]["kind"], "fatal_store");
        assert!(json["collection_error"].is_null());
        assert_eq!(json["processed"], 0);
        assert_eq!(json["last_confirmed_cursor"], "start");
    }
}
