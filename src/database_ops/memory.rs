//! In-process [`Store`] with the same transactional contract as the Postgres store.
//!
//! A transaction works on a private copy of the data taken at `begin` and swaps it in on
//! `commit`; dropping or rolling back discards the copy. With a single writer per run this
//! gives the same all-or-nothing behaviour as a database transaction. Faults can be armed to
//! exercise the engine's failure paths.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::database_ops::store::{
    external_id_order, Location, PricePoint, StagedRecord, Store, StoreTx, StoredGame,
};
use crate::error::StoreError;
use crate::model::{
    FailureReason, GameRecord, LifecycleState, Price, RecordKey, ReviewSummary, Source, Tag,
};
use crate::sync::staleness::StalenessPredicate;

/// Full contents of the store at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemorySnapshot {
    pub main: BTreeMap<RecordKey, GameRecord>,
    pub staging: BTreeMap<RecordKey, StagedRecord>,
    pub tags: BTreeMap<RecordKey, Vec<Tag>>,
    pub reviews: BTreeMap<RecordKey, ReviewSummary>,
    /// Price history, oldest first.
    pub prices: BTreeMap<RecordKey, Vec<PricePoint>>,
}

impl MemorySnapshot {
    /// Keys present in both relations. Always empty for a consistent store.
    pub fn keys_in_both(&self) -> Vec<RecordKey> {
        self.main
            .keys()
            .filter(|k| self.staging.contains_key(*k))
            .cloned()
            .collect()
    }
}

/// How many times each key was inserted into (not updated in) the main relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteStats {
    pub inserts: BTreeMap<RecordKey, usize>,
    pub updates: BTreeMap<RecordKey, usize>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    fail_next_commit: bool,
    fail_moves: bool,
    rejected_keys: HashSet<RecordKey>,
    commits_until_disconnect: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    data: MemorySnapshot,
    stats: WriteStats,
    faults: Faults,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(inner: &Inner) -> Result<(), StoreError> {
        if inner.faults.unavailable {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// Seed a main-relation row with nested data, bypassing transactions and stats.
    pub fn seed(&self, game: StoredGame) {
        let mut inner = self.lock();
        let key = game.record.key.clone();
        inner.data.main.insert(key.clone(), game.record);
        if !game.tags.is_empty() {
            inner.data.tags.insert(key.clone(), game.tags);
        }
        if let Some(reviews) = game.reviews {
            inner.data.reviews.insert(key, reviews);
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        self.lock().data.clone()
    }

    pub fn stats(&self) -> WriteStats {
        self.lock().stats.clone()
    }

    /// Every operation fails with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().faults.unavailable = unavailable;
    }

    /// The next `commit` fails with a transaction error and discards its changes.
    pub fn fail_next_commit(&self) {
        self.lock().faults.fail_next_commit = true;
    }

    /// `move_to_staging` fails after copying the first key, before the deletes.
    pub fn fail_moves(&self, fail: bool) {
        self.lock().faults.fail_moves = fail;
    }

    /// The store becomes unavailable right after `commits` more successful commits.
    pub fn lose_connection_after_commits(&self, commits: usize) {
        let mut inner = self.lock();
        inner.faults.commits_until_disconnect = Some(commits);
        if commits == 0 {
            inner.faults.unavailable = true;
        }
    }

    /// Writes of this key's main row violate a constraint.
    pub fn reject_key(&self, key: RecordKey) {
        self.lock().faults.rejected_keys.insert(key);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            data: inner.data.clone(),
            stats: inner.stats.clone(),
            rejected_keys: inner.faults.rejected_keys.clone(),
            fail_moves: inner.faults.fail_moves,
        }))
    }

    async fn locate(&self, key: &RecordKey) -> Result<Location, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        if inner.data.staging.contains_key(key) {
            return Ok(Location::Staging);
        }
        Ok(match inner.data.main.get(key) {
            Some(record) => Location::Main(Box::new(StoredGame {
                record: record.clone(),
                tags: inner.data.tags.get(key).cloned().unwrap_or_default(),
                reviews: inner.data.reviews.get(key).cloned(),
            })),
            None => Location::Absent,
        })
    }

    async fn select_by_state(
        &self,
        source: Source,
        state: LifecycleState,
        staleness: &StalenessPredicate,
        limit: usize,
    ) -> Result<Vec<RecordKey>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        let mut rows: Vec<&GameRecord> = inner
            .data
            .main
            .values()
            .filter(|r| r.key.source == source && r.state == state)
            .filter(|r| staleness.holds(r.last_checked))
            .collect();
        rows.sort_by(|a, b| {
            a.last_checked
                .cmp(&b.last_checked)
                .then_with(|| a.key.external_id.cmp(&b.key.external_id))
        });
        Ok(rows.into_iter().take(limit).map(|r| r.key.clone()).collect())
    }

    async fn select_recent_releases(
        &self,
        source: Source,
        since: NaiveDate,
        limit: usize,
    ) -> Result<Vec<RecordKey>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        let mut rows: Vec<(NaiveDate, &RecordKey)> = inner
            .data
            .main
            .values()
            .filter(|r| r.key.source == source && r.state == LifecycleState::Active)
            .filter_map(|r| r.release_date.filter(|d| *d >= since).map(|d| (d, &r.key)))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        Ok(rows.into_iter().take(limit).map(|(_, k)| k.clone()).collect())
    }

    async fn staged_records(&self, source: Source) -> Result<Vec<StagedRecord>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner
            .data
            .staging
            .values()
            .filter(|s| s.record.key.source == source)
            .cloned()
            .collect())
    }

    async fn staging_is_empty(&self) -> Result<bool, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner.data.staging.is_empty())
    }

    async fn mark_staging_failed(
        &self,
        key: &RecordKey,
        reason: &FailureReason,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        match inner.data.staging.get_mut(key) {
            Some(row) => {
                row.failure_reason = Some(reason.to_string());
                Ok(())
            }
            None => Err(StoreError::Transaction(format!("{key} is not staged"))),
        }
    }

    async fn max_external_id(&self, source: Source) -> Result<Option<String>, StoreError> {
        let inner = self.lock();
        Self::check_available(&inner)?;
        Ok(inner
            .data
            .main
            .keys()
            .chain(inner.data.staging.keys())
            .filter(|k| k.source == source)
            .map(|k| k.external_id.as_str())
            .max_by(|a, b| external_id_order(a).cmp(&external_id_order(b)))
            .map(str::to_string))
    }
}

struct MemoryTx {
    store: MemoryStore,
    data: MemorySnapshot,
    stats: WriteStats,
    rejected_keys: HashSet<RecordKey>,
    fail_moves: bool,
}

impl MemoryTx {
    fn check_available(&self) -> Result<(), StoreError> {
        MemoryStore::check_available(&self.store.lock())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn move_to_staging(&mut self, keys: &[RecordKey]) -> Result<usize, StoreError> {
        self.check_available()?;
        let unique: BTreeSet<&RecordKey> = keys.iter().collect();
        let now = Utc::now();
        let mut copied = 0usize;
        for key in &unique {
            let Some(record) = self.data.main.get(*key).cloned() else {
                return Err(StoreError::Transaction(format!(
                    "{key} is not in the main relation"
                )));
            };
            let previous_state = record.state;
            let staged = GameRecord {
                state: LifecycleState::Staged,
                ..record
            };
            self.data.staging.insert(
                (*key).clone(),
                StagedRecord {
                    record: staged,
                    previous_state,
                    staged_at: now,
                    failure_reason: None,
                },
            );
            copied += 1;
            if self.fail_moves {
                return Err(StoreError::Transaction(
                    "injected failure while moving to staging".into(),
                ));
            }
        }
        for key in &unique {
            self.data.main.remove(*key);
        }
        debug!(moved = copied, "memory store: moved rows to staging");
        Ok(copied)
    }

    async fn upsert_record(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        self.check_available()?;
        if self.rejected_keys.contains(&record.key) {
            return Err(StoreError::Constraint(format!(
                "injected constraint violation for {}",
                record.key
            )));
        }
        let counter = if self.data.main.contains_key(&record.key) {
            &mut self.stats.updates
        } else {
            &mut self.stats.inserts
        };
        *counter.entry(record.key.clone()).or_default() += 1;
        self.data.main.insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn replace_nested(&mut self, key: &RecordKey, tags: &[Tag]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut deduped: Vec<Tag> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !deduped.contains(tag) {
                deduped.push(tag.clone());
            }
        }
        if deduped.is_empty() {
            self.data.tags.remove(key);
        } else {
            self.data.tags.insert(key.clone(), deduped);
        }
        Ok(())
    }

    async fn replace_reviews(
        &mut self,
        key: &RecordKey,
        reviews: &ReviewSummary,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.data.reviews.insert(key.clone(), reviews.clone());
        Ok(())
    }

    async fn append_price(
        &mut self,
        key: &RecordKey,
        price: &Price,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.data.prices.entry(key.clone()).or_default().push(PricePoint {
            price: price.clone(),
            recorded_at,
        });
        Ok(())
    }

    async fn delete_from_staging(&mut self, key: &RecordKey) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.data.staging.remove(key).is_some())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            store, data, stats, ..
        } = *self;
        let mut inner = store.lock();
        MemoryStore::check_available(&inner)?;
        if inner.faults.fail_next_commit {
            inner.faults.fail_next_commit = false;
            return Err(StoreError::Transaction("injected commit failure".into()));
        }
        inner.data = data;
        inner.stats = stats;
        if let Some(left) = inner.faults.commits_until_disconnect.as_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                inner.faults.unavailable = true;
                inner.faults.commits_until_disconnect = None;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
