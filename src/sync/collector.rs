//! Resumable walk over a catalog listing.
//!
//! The collector owns exactly one cursor: the last position the caller confirmed. Every
//! fetch starts from it, so a page that was handed out but never confirmed is simply fetched
//! again. Nothing here writes to the store.
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database_ops::catalog::CatalogSource;
use crate::error::{SourceError, SyncError};
use crate::model::{CatalogItem, CollectionCursor, FailureReason, RecordFailure};
use crate::sync::rate_limiter::RateLimiter;
use crate::sync::retry::{call_with_retry, RetryPolicy};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error("catalog unavailable while listing at {cursor}: {source}")]
    SourceUnavailable {
        cursor: CollectionCursor,
        source: SourceError,
    },
    #[error("confirmed cursor {got} does not match the outstanding page ({expected:?})")]
    CursorMismatch {
        expected: Option<CollectionCursor>,
        got: CollectionCursor,
    },
}

impl From<CollectError> for SyncError {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::SourceUnavailable { source, .. } => SyncError::from(source),
            mismatch @ CollectError::CursorMismatch { .. } => SyncError::Cursor(mismatch.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOptions {
    pub page_size: usize,
    pub max_items: Option<usize>,
    pub fetch_nested: bool,
    pub retry: RetryPolicy,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_items: None,
            fetch_nested: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// One page handed to the caller. `cursor` is the position to confirm once every item has
/// been durably applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PageBatch {
    pub items: Vec<CatalogItem>,
    pub cursor: CollectionCursor,
    /// Listed identifiers whose details could not be fetched.
    pub unresolved: Vec<RecordFailure>,
}

#[derive(Debug, Clone)]
struct Outstanding {
    cursor: CollectionCursor,
    consumed: usize,
    last: bool,
}

pub struct PaginatedCollector {
    source: Arc<dyn CatalogSource>,
    limiter: RateLimiter,
    options: CollectorOptions,
    confirmed: CollectionCursor,
    confirmed_items: usize,
    outstanding: Option<Outstanding>,
    finished: bool,
    pages_fetched: usize,
}

impl PaginatedCollector {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        limiter: RateLimiter,
        options: CollectorOptions,
        start: CollectionCursor,
    ) -> Self {
        Self {
            source,
            limiter,
            options,
            confirmed: start,
            confirmed_items: 0,
            outstanding: None,
            finished: false,
            pages_fetched: 0,
        }
    }

    /// Last position the caller confirmed. Resuming a later run from here repeats nothing.
    pub fn confirmed_cursor(&self) -> &CollectionCursor {
        &self.confirmed
    }

    pub fn confirmed_items(&self) -> usize {
        self.confirmed_items
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetch the page after the confirmed cursor. `Ok(None)` once the listing is exhausted
    /// or `max_items` items have been confirmed.
    pub async fn next_batch(&mut self) -> Result<Option<PageBatch>, CollectError> {
        if self.finished {
            return Ok(None);
        }
        let remaining = match self.options.max_items {
            Some(max) if self.confirmed_items >= max => {
                self.finished = true;
                return Ok(None);
            }
            Some(max) => Some(max - self.confirmed_items),
            None => None,
        };
        if let Some(stale) = self.outstanding.take() {
            warn!(
                confirmed = %self.confirmed,
                unconfirmed = %stale.cursor,
                "page was never confirmed; fetching it again"
            );
        }

        let from = self.confirmed.clone();
        let page_size = match remaining {
            Some(r) => self.options.page_size.min(r).max(1),
            None => self.options.page_size.max(1),
        };
        let source = Arc::clone(&self.source);
        let page = call_with_retry(&self.limiter, &self.options.retry, "list_page", || {
            source.list_page(&from, page_size)
        })
        .await
        .map_err(|err| CollectError::SourceUnavailable {
            cursor: from.clone(),
            source: err,
        })?;
        self.pages_fetched += 1;

        let mut kept = page.items.len();
        let mut last = page.next.is_none();
        if let Some(r) = remaining {
            if kept >= r {
                if kept > r {
                    debug!(kept = r, dropped = kept - r, "truncating page at max_items");
                }
                kept = r;
                last = true;
            }
        }
        let cursor = match (&page.next, last) {
            (Some(next), false) => next.clone(),
            _ => self.source.paging().advance(&from, &page, kept),
        };
        let mut listed = page.items;
        listed.truncate(kept);

        if listed.is_empty() && last {
            self.finished = true;
            return Ok(None);
        }

        let consumed = listed.len();
        let (mut items, unresolved) = if self.source.listing_is_complete() {
            (listed, Vec::new())
        } else {
            self.hydrate(listed).await
        };
        if self.options.fetch_nested {
            self.attach_nested(&mut items).await;
        }

        debug!(
            from = %from,
            cursor = %cursor,
            items = items.len(),
            unresolved = unresolved.len(),
            "fetched page"
        );
        self.outstanding = Some(Outstanding {
            cursor: cursor.clone(),
            consumed,
            last,
        });
        Ok(Some(PageBatch {
            items,
            cursor,
            unresolved,
        }))
    }

    /// Advance past the outstanding page. Only call once its items are durably applied.
    pub fn confirm(&mut self, cursor: &CollectionCursor) -> Result<(), CollectError> {
        match self.outstanding.take() {
            Some(page) if &page.cursor == cursor => {
                self.confirmed = page.cursor;
                self.confirmed_items += page.consumed;
                if page.last {
                    self.finished = true;
                }
                info!(
                    source = %self.source.source(),
                    cursor = %self.confirmed,
                    items = self.confirmed_items,
                    "cursor confirmed"
                );
                Ok(())
            }
            other => {
                let expected = other.as_ref().map(|p| p.cursor.clone());
                self.outstanding = other;
                Err(CollectError::CursorMismatch {
                    expected,
                    got: cursor.clone(),
                })
            }
        }
    }

    async fn hydrate(&self, listed: Vec<CatalogItem>) -> (Vec<CatalogItem>, Vec<RecordFailure>) {
        let mut items = Vec::with_capacity(listed.len());
        let mut unresolved = Vec::new();
        for entry in listed {
            let id = entry.key.external_id.clone();
            let source = Arc::clone(&self.source);
            let result = call_with_retry(&self.limiter, &self.options.retry, "fetch_one", || {
                source.fetch_one(&id)
            })
            .await;
            match result {
                Ok(item) => items.push(item),
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "could not fetch listed item");
                    unresolved.push(RecordFailure::new(entry.key, failure_reason(&err)));
                }
            }
        }
        (items, unresolved)
    }

    async fn attach_nested(&self, items: &mut [CatalogItem]) {
        for item in items.iter_mut().filter(|i| i.tags.is_none()) {
            let id = item.key.external_id.clone();
            let source = Arc::clone(&self.source);
            let result = call_with_retry(&self.limiter, &self.options.retry, "fetch_nested", || {
                source.fetch_nested(&id)
            })
            .await;
            match result {
                Ok(tags) => item.tags = Some(tags),
                Err(err) => warn!(key = %item.key, error = %err, "tags unavailable; keeping stored tags"),
            }
        }
    }
}

pub(crate) fn failure_reason(err: &SourceError) -> FailureReason {
    match err {
        SourceError::NotFound => FailureReason::NotFound,
        SourceError::Throttled { .. } => FailureReason::Throttled,
        SourceError::Unavailable(msg) | SourceError::Decode(msg) => {
            FailureReason::SourceUnavailable(msg.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::catalog::PagingMode;
    use crate::model::{RecordKey, Source, Tag};
    use crate::sync::rate_limiter::RateLimitSettings;
    use crate::sync::testing::ScriptedSource;
    use std::time::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            requests_per_second: 0.0,
            ..RateLimitSettings::default()
        })
    }

    fn options(page_size: usize, max_items: Option<usize>) -> CollectorOptions {
        CollectorOptions {
            page_size,
            max_items,
            fetch_nested: false,
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                ceiling: Duration::from_millis(100),
            },
        }
    }

    fn ids(batch: &PageBatch) -> Vec<String> {
        batch.items.iter().map(|i| i.key.external_id.clone()).collect()
    }

    async fn drain(collector: &mut PaginatedCollector) -> Vec<Vec<String>> {
        let mut pages = Vec::new();
        while let Some(batch) = collector.next_batch().await.unwrap() {
            pages.push(ids(&batch));
            collector.confirm(&batch.cursor).unwrap();
        }
        pages
    }

    #[tokio::test]
    async fn max_items_stops_after_two_full_pages() {
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 6));
        let mut collector = PaginatedCollector::new(
            source.clone(),
            limiter(),
            options(2, Some(4)),
            CollectionCursor::Start,
        );
        let pages = drain(&mut collector).await;
        assert_eq!(pages, vec![vec!["1", "2"], vec!["3", "4"]]);
        assert_eq!(source.list_calls().len(), 2, "third page must not be fetched");
        assert_eq!(collector.confirmed_cursor(), &CollectionCursor::Offset(4));
    }

    #[tokio::test]
    async fn crossing_page_is_truncated_at_last_yielded_item() {
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 6));
        let mut collector =
            PaginatedCollector::new(source, limiter(), options(4, Some(5)), CollectionCursor::Start);
        let pages = drain(&mut collector).await;
        assert_eq!(pages, vec![vec!["1", "2", "3", "4"], vec!["5"]]);
        assert_eq!(collector.confirmed_cursor(), &CollectionCursor::After("5".into()));
        assert_eq!(collector.confirmed_items(), 5);
    }

    #[tokio::test]
    async fn offset_cursor_counts_entries_that_yielded_no_item() {
        let source = Arc::new(
            ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 5)
                .unmapped("2")
                .unmapped("4"),
        );
        let mut collector =
            PaginatedCollector::new(source.clone(), limiter(), options(3, None), CollectionCursor::Start);
        let pages = drain(&mut collector).await;
        assert_eq!(pages, vec![vec!["1", "3"], vec!["5"]]);
        assert_eq!(collector.confirmed_cursor(), &CollectionCursor::Offset(5));
        assert_eq!(collector.confirmed_items(), 3);

        // a later run resumes past the end instead of repeating the tail
        let mut resumed =
            PaginatedCollector::new(source, limiter(), options(3, None), CollectionCursor::Offset(5));
        assert!(resumed.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unconfirmed_page_is_fetched_again() {
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 4));
        let mut collector =
            PaginatedCollector::new(source.clone(), limiter(), options(2, None), CollectionCursor::Start);

        let first = collector.next_batch().await.unwrap().unwrap();
        collector.confirm(&first.cursor).unwrap();
        let second = collector.next_batch().await.unwrap().unwrap();
        assert_eq!(ids(&second), vec!["3", "4"]);

        // never confirmed
        let again = collector.next_batch().await.unwrap().unwrap();
        assert_eq!(ids(&again), vec!["3", "4"]);
        assert_eq!(
            source.list_calls(),
            vec![
                CollectionCursor::Start,
                CollectionCursor::Offset(2),
                CollectionCursor::Offset(2)
            ]
        );
        collector.confirm(&again.cursor).unwrap();
        assert!(collector.next_batch().await.unwrap().is_none());
        assert!(collector.is_finished());
    }

    #[tokio::test]
    async fn resumes_from_confirmed_cursor() {
        let source = Arc::new(ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 5));
        let mut collector = PaginatedCollector::new(
            source,
            limiter(),
            options(2, None),
            CollectionCursor::After("3".into()),
        );
        let pages = drain(&mut collector).await;
        assert_eq!(pages, vec![vec!["4", "5"]]);
    }

    #[tokio::test]
    async fn confirm_rejects_unknown_cursor() {
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 4));
        let mut collector =
            PaginatedCollector::new(source, limiter(), options(2, None), CollectionCursor::Start);
        let batch = collector.next_batch().await.unwrap().unwrap();
        let err = collector.confirm(&CollectionCursor::Offset(99)).unwrap_err();
        assert!(matches!(err, CollectError::CursorMismatch { .. }));
        collector.confirm(&batch.cursor).unwrap();
        assert_eq!(collector.confirmed_cursor(), &CollectionCursor::Offset(2));
    }

    #[tokio::test]
    async fn exhausted_page_retries_surface_source_unavailable() {
        tokio::time::pause();
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 4));
        source.fail_listing_at(
            CollectionCursor::Offset(2),
            vec![SourceError::Unavailable("503".into()); 3],
        );
        let mut collector =
            PaginatedCollector::new(source, limiter(), options(2, None), CollectionCursor::Start);
        let first = collector.next_batch().await.unwrap().unwrap();
        collector.confirm(&first.cursor).unwrap();

        let err = collector.next_batch().await.unwrap_err();
        assert_eq!(
            err,
            CollectError::SourceUnavailable {
                cursor: CollectionCursor::Offset(2),
                source: SourceError::Unavailable("503".into()),
            }
        );
        assert_eq!(collector.confirmed_cursor(), &CollectionCursor::Offset(2));
    }

    #[tokio::test]
    async fn transient_listing_failure_within_budget_is_invisible() {
        tokio::time::pause();
        let source = Arc::new(ScriptedSource::numbered(Source::Nintendo, PagingMode::Offset, 2));
        source.fail_listing_at(
            CollectionCursor::Start,
            vec![
                SourceError::Unavailable("reset".into()),
                SourceError::Throttled { retry_after: None },
            ],
        );
        let mut collector =
            PaginatedCollector::new(source, limiter(), options(2, None), CollectionCursor::Start);
        assert_eq!(drain(&mut collector).await, vec![vec!["1", "2"]]);
    }

    #[tokio::test]
    async fn incomplete_listings_are_hydrated_and_tagged() {
        tokio::time::pause();
        let source = Arc::new(
            ScriptedSource::numbered(Source::Steam, PagingMode::AfterId, 3)
                .incomplete_listing()
                .with_tags("1", &["Indie"])
                .with_tags("3", &["RPG", "Indie"]),
        );
        source.fail_fetch("2", SourceError::NotFound);
        source.fail_nested("3", SourceError::Unavailable("timeout".into()));
        let mut opts = options(5, None);
        opts.fetch_nested = true;
        let mut collector =
            PaginatedCollector::new(source.clone(), limiter(), opts, CollectionCursor::Start);

        let batch = collector.next_batch().await.unwrap().unwrap();
        assert_eq!(ids(&batch), vec!["1", "3"]);
        assert_eq!(batch.items[0].tags, Some(vec![Tag::new("Indie")]));
        assert_eq!(batch.items[1].tags, None);
        assert_eq!(batch.unresolved.len(), 1);
        assert_eq!(batch.unresolved[0].key, RecordKey::new(Source::Steam, "2"));
        assert_eq!(batch.unresolved[0].reason, FailureReason::NotFound);
        assert_eq!(batch.cursor, CollectionCursor::After("3".into()));
        assert_eq!(source.fetch_calls(), vec!["1", "2", "3"]);
    }
}
