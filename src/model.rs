//! Shared record types: catalog items as fetched, game records as stored, cursors and
//! per-record failure accounting.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalization::release_date::{is_early_access, parse_release_date};

/// Which external catalog a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Steam,
    Nintendo,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Steam => "steam",
            Source::Nintendo => "nintendo",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "steam" | "steam-store" => Ok(Source::Steam),
            "nintendo" | "eshop" | "nintendo-eshop" => Ok(Source::Nintendo),
            other => Err(format!("unknown catalog source '{other}'")),
        }
    }
}

/// Source-scoped identity of a game. Identifiers are opaque strings; two catalogs may
/// reuse the same identifier for unrelated games.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub source: Source,
    pub external_id: String,
}

impl RecordKey {
    pub fn new(source: Source, external_id: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    PendingRelease,
    /// Transient; only ever held by rows in the staging relation.
    Staged,
    Retired,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::PendingRelease => "pending_release",
            LifecycleState::Staged => "staged",
            LifecycleState::Retired => "retired",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "pending_release" => Ok(LifecycleState::PendingRelease),
            "staged" => Ok(LifecycleState::Staged),
            "retired" => Ok(LifecycleState::Retired),
            other => Err(format!("unknown lifecycle state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub currency: Option<String>,
    pub initial_minor: Option<i64>,
    pub final_minor: Option<i64>,
    pub discount_percent: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub coming_soon: bool,
    /// Free-form date as the catalog displays it ("25 Nov, 2025", "Q3 2026", "TBA").
    pub date_text: Option<String>,
}

/// Typed view of the fields this crate cares about. Everything else the catalog returned
/// stays in `extra` and is stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamePayload {
    pub name: String,
    pub kind: Option<String>,
    pub description: Option<String>,
    pub price: Option<Price>,
    pub is_free: Option<bool>,
    pub release: ReleaseInfo,
    pub categories: Vec<String>,
    pub publishers: Vec<String>,
    pub extra: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(pub String);

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Tag(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub review_score: Option<i32>,
    pub review_score_desc: Option<String>,
    pub total_positive: i64,
    pub total_negative: i64,
    pub total_reviews: i64,
}

/// A record exactly as one catalog call returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub key: RecordKey,
    pub payload: GamePayload,
    /// `None` when the catalog call did not include review statistics.
    pub reviews: Option<ReviewSummary>,
    /// `None` when tags were not collected; `Some(vec![])` means "collected, none found".
    pub tags: Option<Vec<Tag>>,
    pub fetched_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn new(key: RecordKey, payload: GamePayload) -> Self {
        Self {
            key,
            payload,
            reviews: None,
            tags: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_reviews(mut self, reviews: ReviewSummary) -> Self {
        self.reviews = Some(reviews);
        self
    }

    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// State a stored copy of this item should hold. Early-access games whose date has
    /// passed are playable even while the storefront still flags them coming soon.
    pub fn lifecycle_state(&self) -> LifecycleState {
        if !self.payload.release.coming_soon {
            return LifecycleState::Active;
        }
        let released_early = is_early_access(&self.payload.categories)
            && self
                .release_date()
                .is_some_and(|d| d < Utc::now().date_naive());
        if released_early {
            LifecycleState::Active
        } else {
            LifecycleState::PendingRelease
        }
    }

    pub fn release_date(&self) -> Option<NaiveDate> {
        let text = self.payload.release.date_text.as_deref()?;
        parse_release_date(text, Utc::now().date_naive())
    }

    /// Storefronts list DLC, demos, soundtracks and tools next to games.
    pub fn is_game(&self) -> bool {
        match self.payload.kind.as_deref() {
            Some(kind) => kind.trim().eq_ignore_ascii_case("game"),
            None => true,
        }
    }
}

/// Main-relation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub key: RecordKey,
    pub state: LifecycleState,
    pub payload: GamePayload,
    pub release_date: Option<NaiveDate>,
    pub last_checked: DateTime<Utc>,
}

impl GameRecord {
    pub fn from_item(item: &CatalogItem, state: LifecycleState, checked_at: DateTime<Utc>) -> Self {
        Self {
            key: item.key.clone(),
            state,
            payload: item.payload.clone(),
            release_date: item.release_date(),
            last_checked: checked_at,
        }
    }
}

/// Resumable position within one catalog listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionCursor {
    #[default]
    Start,
    Offset(u64),
    /// Listing continues with identifiers strictly greater than this one.
    After(String),
}

impl fmt::Display for CollectionCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionCursor::Start => f.write_str("start"),
            CollectionCursor::Offset(n) => write!(f, "offset:{n}"),
            CollectionCursor::After(id) => write!(f, "after:{id}"),
        }
    }
}

impl FromStr for CollectionCursor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("start") {
            return Ok(CollectionCursor::Start);
        }
        if let Some(rest) = s.strip_prefix("offset:") {
            return rest
                .trim()
                .parse::<u64>()
                .map(CollectionCursor::Offset)
                .map_err(|e| format!("invalid offset cursor '{s}': {e}"));
        }
        if let Some(rest) = s.strip_prefix("after:") {
            let id = rest.trim();
            if id.is_empty() {
                return Err(format!("invalid cursor '{s}': empty identifier"));
            }
            return Ok(CollectionCursor::After(id.to_string()));
        }
        Err(format!(
            "invalid cursor '{s}'; expected 'start', 'offset:N' or 'after:ID'"
        ))
    }
}

/// Why a single record was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Validation(String),
    Constraint(String),
    Transaction(String),
    SourceUnavailable(String),
    NotFound,
    Throttled,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Validation(_) => "validation",
            FailureReason::Constraint(_) => "constraint",
            FailureReason::Transaction(_) => "transaction",
            FailureReason::SourceUnavailable(_) => "source_unavailable",
            FailureReason::NotFound => "not_found",
            FailureReason::Throttled => "throttled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Validation(d)
            | FailureReason::Constraint(d)
            | FailureReason::Transaction(d)
            | FailureReason::SourceUnavailable(d) => write!(f, "{}: {}", self.code(), d),
            FailureReason::NotFound | FailureReason::Throttled => f.write_str(self.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub key: RecordKey,
    pub reason: FailureReason,
}

impl RecordFailure {
    pub fn new(key: RecordKey, reason: FailureReason) -> Self {
        Self { key, reason }
    }
}
