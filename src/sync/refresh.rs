//! Review statistics move fastest right after release; recently released records are
//! refetched on every run and applied through the reconciler.
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::database_ops::catalog::CatalogSource;
use crate::database_ops::store::Store;
use crate::error::{StoreError, SyncError};
use crate::model::RecordFailure;
use crate::sync::collector::failure_reason;
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::reconciler::{BatchReconciler, ReconcileError, ReconciliationResult};
use crate::sync::retry::{call_with_retry, RetryPolicy};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RefreshError {
    #[error("could not select recent releases: {0}")]
    Select(StoreError),
    #[error("store unavailable during review refresh: {message}")]
    StoreUnavailable {
        partial: ReconciliationResult,
        message: String,
    },
}

impl From<RefreshError> for SyncError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Select(store) => SyncError::from(store),
            RefreshError::StoreUnavailable { message, .. } => SyncError::FatalStore(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOptions {
    pub days_back: i64,
    pub limit: usize,
    pub fetch_nested: bool,
    pub retry: RetryPolicy,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            days_back: 30,
            limit: 1000,
            fetch_nested: true,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct ReviewRefresher {
    store: Arc<dyn Store>,
    source: Arc<dyn CatalogSource>,
    limiter: RateLimiter,
    options: RefreshOptions,
}

impl ReviewRefresher {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn CatalogSource>,
        limiter: RateLimiter,
        options: RefreshOptions,
    ) -> Self {
        Self {
            store,
            source,
            limiter,
            options,
        }
    }

    pub async fn run(&self) -> Result<ReconciliationResult, RefreshError> {
        self.run_at(Utc::now().date_naive()).await
    }

    pub async fn run_at(&self, today: NaiveDate) -> Result<ReconciliationResult, RefreshError> {
        let since = today - Duration::days(self.options.days_back.max(0));
        let keys = self
            .store
            .select_recent_releases(self.source.source(), since, self.options.limit)
            .await
            .map_err(|err| {
                if err.is_fatal() {
                    RefreshError::StoreUnavailable {
                        partial: ReconciliationResult::default(),
                        message: err.to_string(),
                    }
                } else {
                    RefreshError::Select(err)
                }
            })?;
        info!(source = %self.source.source(), since = %since, records = keys.len(), "refreshing recent releases");

        let mut result = ReconciliationResult::default();
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            let source = Arc::clone(&self.source);
            let id = key.external_id.clone();
            let fetched = call_with_retry(&self.limiter, &self.options.retry, "fetch_one", || {
                source.fetch_one(&id)
            })
            .await;
            let mut item = match fetched {
                Ok(item) => item,
                Err(err) => {
                    warn!(key = %key, error = %err, "refresh fetch failed");
                    result.record_failure(RecordFailure::new(key, failure_reason(&err)));
                    continue;
                }
            };
            if self.options.fetch_nested && item.tags.is_none() {
                match call_with_retry(&self.limiter, &self.options.retry, "fetch_nested", || {
                    source.fetch_nested(&id)
                })
                .await
                {
                    Ok(tags) => item.tags = Some(tags),
                    Err(err) => warn!(key = %key, error = %err, "tags unavailable; keeping stored tags"),
                }
            }
            items.push(item);
        }

        let reconciler = BatchReconciler::new(Arc::clone(&self.store));
        match reconciler.apply(&items).await {
            Ok(applied) => {
                result.merge(applied);
                Ok(result)
            }
            Err(ReconcileError::StoreUnavailable { partial, message }) => {
                result.merge(partial);
                Err(RefreshError::StoreUnavailable {
                    partial: result,
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::catalog::PagingMode;
    use crate::database_ops::memory::MemoryStore;
    use crate::database_ops::store::StoredGame;
    use crate::error::SourceError;
    use crate::model::{CatalogItem, GameRecord, LifecycleState, RecordKey, ReviewSummary, Source, Tag};
    use crate::sync::rate_limiter::RateLimitSettings;
    use crate::sync::testing::{game, ScriptedSource};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 30).unwrap()
    }

    fn dated(id: &str, date_text: &str) -> CatalogItem {
        let mut item = game(Source::Steam, id);
        item.payload.release.date_text = Some(date_text.into());
        item
    }

    fn released(id: &str, date_text: &str) -> StoredGame {
        let item = dated(id, date_text);
        StoredGame {
            record: GameRecord::from_item(&item, LifecycleState::Active, Utc::now()),
            tags: vec![],
            reviews: None,
        }
    }

    fn reviews(total: i64) -> ReviewSummary {
        ReviewSummary {
            review_score: Some(8),
            review_score_desc: Some("Very Positive".into()),
            total_positive: total - 1,
            total_negative: 1,
            total_reviews: total,
        }
    }

    fn refresher(store: &MemoryStore, source: Arc<ScriptedSource>) -> ReviewRefresher {
        ReviewRefresher::new(
            Arc::new(store.clone()),
            source,
            RateLimiter::new(RateLimitSettings {
                requests_per_second: 0.0,
                ..RateLimitSettings::default()
            }),
            RefreshOptions {
                retry: RetryPolicy {
                    max_retries: 0,
                    ..RetryPolicy::default()
                },
                ..RefreshOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn only_recent_releases_are_refetched() {
        let store = MemoryStore::new();
        store.seed(released("1", "20 Jun, 2025"));
        store.seed(released("2", "5 Jan, 2025"));
        store.seed(released("3", "1 Jun, 2025"));

        let source = Arc::new(
            ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 3)
                .with_detail(dated("1", "20 Jun, 2025").with_reviews(reviews(120)))
                .with_detail(dated("3", "1 Jun, 2025").with_reviews(reviews(40)))
                .with_tags("1", &["Indie"]),
        );
        let result = refresher(&store, source.clone()).run_at(today()).await.unwrap();
        assert_eq!(result.updated, 2);
        assert_eq!(source.fetch_calls(), vec!["1", "3"]);

        let snap = store.snapshot();
        let key = RecordKey::new(Source::Steam, "1");
        assert_eq!(snap.reviews[&key].total_reviews, 120);
        assert_eq!(snap.main[&key].release_date, NaiveDate::from_ymd_opt(2025, 6, 20));
        assert_eq!(snap.tags[&key], vec![Tag::new("Indie")]);
        assert!(!snap.reviews.contains_key(&RecordKey::new(Source::Steam, "2")));
    }

    #[tokio::test]
    async fn fetch_failures_are_tallied() {
        let store = MemoryStore::new();
        store.seed(released("1", "20 Jun, 2025"));
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 1));
        source.fail_fetch("1", SourceError::NotFound);

        let result = refresher(&store, source).run_at(today()).await.unwrap();
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].reason.code(), "not_found");
    }
}
