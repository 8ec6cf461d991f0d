//! Read-only capability over one external game catalog.
use async_trait::async_trait;

use crate::error::SourceError;
use crate::model::{CatalogItem, CollectionCursor, Source, Tag};

/// How a catalog's listing cursor advances, used to compute a cursor for a truncated page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// `offset:N`, advanced by the number of listing positions consumed.
    Offset,
    /// `after:ID`, advanced to the identifier of the last item consumed.
    AfterId,
}

impl PagingMode {
    /// Cursor positioned right after the first `kept` items of `page`, fetched at `from`.
    pub fn advance(self, from: &CollectionCursor, page: &Page, kept: usize) -> CollectionCursor {
        match self {
            PagingMode::Offset => {
                let base = match from {
                    CollectionCursor::Offset(n) => *n,
                    _ => 0,
                };
                CollectionCursor::Offset(base + page.positions_consumed(kept))
            }
            PagingMode::AfterId => match kept.checked_sub(1).and_then(|i| page.items.get(i)) {
                Some(item) => CollectionCursor::After(item.key.external_id.clone()),
                None => from.clone(),
            },
        }
    }
}

/// One listing page. `next == None` means the listing is exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<CatalogItem>,
    pub next: Option<CollectionCursor>,
    /// Listing position of each item, relative to the page start.
    positions: Vec<u64>,
    /// Listing positions the whole page covers, including entries that mapped to no item.
    span: u64,
}

impl Page {
    /// Page where every listing entry became an item.
    pub fn new(items: Vec<CatalogItem>, next: Option<CollectionCursor>) -> Self {
        let span = items.len() as u64;
        Self {
            positions: (0..span).collect(),
            items,
            next,
            span,
        }
    }

    /// Page built from `span` listing entries, some of which were dropped. `entries` pairs
    /// each kept item with its position on the page, in listing order.
    pub fn from_positions(
        entries: Vec<(u64, CatalogItem)>,
        span: u64,
        next: Option<CollectionCursor>,
    ) -> Self {
        let (positions, items) = entries.into_iter().unzip();
        Self {
            items,
            next,
            positions,
            span,
        }
    }

    /// Listing positions covered by the first `kept` items. Keeping every item covers the
    /// whole page, trailing dropped entries included.
    pub fn positions_consumed(&self, kept: usize) -> u64 {
        if kept >= self.items.len() {
            return self.span;
        }
        kept.checked_sub(1)
            .and_then(|i| self.positions.get(i))
            .map_or(0, |p| p + 1)
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source(&self) -> Source;

    fn paging(&self) -> PagingMode;

    /// Whether listed items already carry full details. When false the collector hydrates
    /// each listed identifier with `fetch_one`.
    fn listing_is_complete(&self) -> bool {
        true
    }

    async fn list_page(
        &self,
        cursor: &CollectionCursor,
        page_size: usize,
    ) -> Result<Page, SourceError>;

    async fn fetch_one(&self, external_id: &str) -> Result<CatalogItem, SourceError>;

    async fn fetch_nested(&self, external_id: &str) -> Result<Vec<Tag>, SourceError>;
}
