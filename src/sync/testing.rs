//! Scripted catalog used by the engine tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::database_ops::catalog::{CatalogSource, Page, PagingMode};
use crate::database_ops::store::external_id_order;
use crate::error::SourceError;
use crate::model::{CatalogItem, CollectionCursor, GamePayload, RecordKey, Source, Tag};

pub fn game(source: Source, id: &str) -> CatalogItem {
    CatalogItem::new(
        RecordKey::new(source, id),
        GamePayload {
            name: format!("Game {id}"),
            kind: Some("game".into()),
            ..GamePayload::default()
        },
    )
}

#[derive(Default)]
struct Script {
    list_failures: HashMap<CollectionCursor, VecDeque<SourceError>>,
    fetch_failures: HashMap<String, SourceError>,
    nested_failures: HashMap<String, SourceError>,
    list_calls: Vec<CollectionCursor>,
    fetch_calls: Vec<String>,
}

pub struct ScriptedSource {
    source: Source,
    paging: PagingMode,
    complete: bool,
    listing: Vec<CatalogItem>,
    details: HashMap<String, CatalogItem>,
    tags: HashMap<String, Vec<Tag>>,
    unmapped: HashSet<String>,
    script: Mutex<Script>,
}

impl ScriptedSource {
    pub fn new(source: Source, paging: PagingMode, listing: Vec<CatalogItem>) -> Self {
        Self {
            source,
            paging,
            complete: true,
            listing,
            details: HashMap::new(),
            tags: HashMap::new(),
            unmapped: HashSet::new(),
            script: Mutex::new(Script::default()),
        }
    }

    /// `count` games with ids `1..=count`.
    pub fn numbered(source: Source, paging: PagingMode, count: usize) -> Self {
        let listing = (1..=count).map(|i| game(source, &i.to_string())).collect();
        Self::new(source, paging, listing)
    }

    pub fn incomplete_listing(mut self) -> Self {
        self.complete = false;
        self
    }

    /// What `fetch_one` returns for this id instead of the listed item.
    pub fn with_detail(mut self, item: CatalogItem) -> Self {
        self.details.insert(item.key.external_id.clone(), item);
        self
    }

    pub fn with_tags(mut self, id: &str, tags: &[&str]) -> Self {
        self.tags
            .insert(id.to_string(), tags.iter().map(|t| Tag::new(*t)).collect());
        self
    }

    /// The listing entry for this id occupies a position but yields no item.
    pub fn unmapped(mut self, id: &str) -> Self {
        self.unmapped.insert(id.to_string());
        self
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// The next listing calls at `cursor` fail with these errors, in order.
    pub fn fail_listing_at(&self, cursor: CollectionCursor, errors: Vec<SourceError>) {
        self.script()
            .list_failures
            .entry(cursor)
            .or_default()
            .extend(errors);
    }

    /// Every `fetch_one` of this id fails.
    pub fn fail_fetch(&self, id: &str, error: SourceError) {
        self.script().fetch_failures.insert(id.to_string(), error);
    }

    pub fn fail_nested(&self, id: &str, error: SourceError) {
        self.script().nested_failures.insert(id.to_string(), error);
    }

    pub fn heal_fetch(&self, id: &str) {
        self.script().fetch_failures.remove(id);
    }

    pub fn list_calls(&self) -> Vec<CollectionCursor> {
        self.script().list_calls.clone()
    }

    pub fn fetch_calls(&self) -> Vec<String> {
        self.script().fetch_calls.clone()
    }

    fn page_start(&self, cursor: &CollectionCursor) -> usize {
        match cursor {
            CollectionCursor::Start => 0,
            CollectionCursor::Offset(n) => *n as usize,
            CollectionCursor::After(id) => self
                .listing
                .iter()
                .position(|i| {
                    external_id_order(&i.key.external_id) > external_id_order(id)
                })
                .unwrap_or(self.listing.len()),
        }
    }
}

#[async_trait]
impl CatalogSource for ScriptedSource {
    fn source(&self) -> Source {
        self.source
    }

    fn paging(&self) -> PagingMode {
        self.paging
    }

    fn listing_is_complete(&self) -> bool {
        self.complete
    }

    async fn list_page(
        &self,
        cursor: &CollectionCursor,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        {
            let mut script = self.script();
            script.list_calls.push(cursor.clone());
            if let Some(err) = script
                .list_failures
                .get_mut(cursor)
                .and_then(|queue| queue.pop_front())
            {
                return Err(err);
            }
        }
        let start = self.page_start(cursor).min(self.listing.len());
        let end = (start + page_size).min(self.listing.len());
        let entries: Vec<(u64, CatalogItem)> = (0u64..)
            .zip(&self.listing[start..end])
            .filter(|(_, item)| !self.unmapped.contains(&item.key.external_id))
            .map(|(position, item)| (position, item.clone()))
            .collect();
        let mut page = Page::from_positions(entries, (end - start) as u64, None);
        if end < self.listing.len() {
            page.next = Some(self.paging.advance(cursor, &page, page.items.len()));
        }
        Ok(page)
    }

    async fn fetch_one(&self, external_id: &str) -> Result<CatalogItem, SourceError> {
        {
            let mut script = self.script();
            script.fetch_calls.push(external_id.to_string());
            if let Some(err) = script.fetch_failures.get(external_id) {
                return Err(err.clone());
            }
        }
        if let Some(item) = self.details.get(external_id) {
            return Ok(item.clone());
        }
        self.listing
            .iter()
            .find(|i| i.key.external_id == external_id)
            .cloned()
            .ok_or(SourceError::NotFound)
    }

    async fn fetch_nested(&self, external_id: &str) -> Result<Vec<Tag>, SourceError> {
        if let Some(err) = self.script().nested_failures.get(external_id) {
            return Err(err.clone());
        }
        Ok(self.tags.get(external_id).cloned().unwrap_or_default())
    }
}
