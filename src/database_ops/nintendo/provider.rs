use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::database_ops::catalog::{CatalogSource, Page, PagingMode};
use crate::database_ops::http::status_error;
use crate::error::SourceError;
use crate::model::{
    CatalogItem, CollectionCursor, GamePayload, Price, RecordKey, ReleaseInfo, Source, Tag,
};
use crate::util::env::env_opt;

const NINTENDO_SEARCH_URL: &str = "https://search.nintendo-europe.com/en/select";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Deserialize)]
struct SolrResp {
    response: SolrBody,
}

#[derive(Debug, Deserialize)]
struct SolrBody {
    #[serde(rename = "numFound", default)]
    num_found: u64,
    #[serde(default)]
    docs: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct GameDoc {
    #[serde(default)]
    fs_id: Option<Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default)]
    excerpt: Option<String>,
    #[serde(default)]
    date_from: Option<String>,
    #[serde(default)]
    pretty_date_s: Option<String>,
    #[serde(default)]
    price_regular_f: Option<f64>,
    #[serde(default)]
    price_discounted_f: Option<f64>,
    #[serde(default)]
    price_discount_percentage_f: Option<f64>,
    #[serde(default)]
    pretty_game_categories_txt: Vec<String>,
    #[serde(default)]
    game_categories_txt: Vec<String>,
}

/// Nintendo eShop (Europe) via its public Solr search endpoint. Documents carry the whole
/// record, so listing needs no per-item hydration.
pub struct NintendoCatalog {
    client: Client,
    search_url: String,
}

impl NintendoCatalog {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            search_url: NINTENDO_SEARCH_URL.to_string(),
        }
    }

    /// Env: NINTENDO_SEARCH_URL (override).
    pub fn from_env() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        let mut catalog = Self::new(client);
        if let Some(url) = env_opt("NINTENDO_SEARCH_URL") {
            catalog.search_url = url;
        }
        Ok(catalog)
    }

    async fn select(&self, filter: &str, start: u64, rows: usize) -> Result<SolrBody, SourceError> {
        let query = [
            ("q", "*".to_string()),
            ("fq", filter.to_string()),
            ("sort", "sorting_title asc".to_string()),
            ("start", start.to_string()),
            ("rows", rows.to_string()),
            ("wt", "json".to_string()),
        ];
        let resp = self.client.get(&self.search_url).query(&query).send().await?;
        if let Some(err) = status_error(resp.status(), resp.headers()) {
            debug!(status = resp.status().as_u16(), "nintendo search rejected");
            return Err(err);
        }
        let body: SolrResp = resp.json().await?;
        Ok(body.response)
    }

    async fn fetch_doc(&self, external_id: &str) -> Result<Value, SourceError> {
        if external_id.is_empty() || !external_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SourceError::NotFound);
        }
        let filter = format!("type:GAME AND fs_id:{external_id}");
        let body = self.select(&filter, 0, 1).await?;
        body.docs.into_iter().next().ok_or(SourceError::NotFound)
    }
}

fn offset_of(cursor: &CollectionCursor) -> Result<u64, SourceError> {
    match cursor {
        CollectionCursor::Start => Ok(0),
        CollectionCursor::Offset(n) => Ok(*n),
        CollectionCursor::After(_) => Err(SourceError::Decode(
            "nintendo listing pages by offset, not identifier".into(),
        )),
    }
}

fn id_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn minor_units(euros: f64) -> i64 {
    (euros * 100.0).round() as i64
}

/// Map one Solr document; documents without an `fs_id` cannot be keyed and are dropped.
fn item_from_doc(doc: Value, today: NaiveDate) -> Result<Option<CatalogItem>, SourceError> {
    let parsed: GameDoc = serde_json::from_value(doc.clone())?;
    let Some(id) = parsed.fs_id.as_ref().and_then(id_text) else {
        return Ok(None);
    };

    let iso_date = parsed
        .date_from
        .as_deref()
        .and_then(|d| d.get(..10))
        .filter(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok())
        .map(str::to_string);
    let coming_soon = iso_date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .map(|d| d > today)
        .unwrap_or(false);
    let date_text = iso_date.or(parsed.pretty_date_s.filter(|d| !d.trim().is_empty()));

    let price = match (parsed.price_regular_f, parsed.price_discounted_f) {
        (None, None) => None,
        (regular, discounted) => Some(Price {
            currency: Some("EUR".to_string()),
            initial_minor: regular.map(minor_units),
            final_minor: discounted.filter(|d| *d > 0.0).or(regular).map(minor_units),
            discount_percent: parsed.price_discount_percentage_f.map(|p| p.round() as i64),
        }),
    };
    let categories = if parsed.pretty_game_categories_txt.is_empty() {
        parsed.game_categories_txt
    } else {
        parsed.pretty_game_categories_txt
    };

    let payload = GamePayload {
        name: parsed.title.unwrap_or_default(),
        kind: Some("game".to_string()),
        description: parsed.excerpt,
        is_free: price.as_ref().and_then(|p| p.initial_minor).map(|p| p == 0),
        price,
        release: ReleaseInfo {
            coming_soon,
            date_text,
        },
        categories,
        publishers: parsed.publisher.into_iter().collect(),
        extra: doc,
    };
    Ok(Some(CatalogItem::new(RecordKey::new(Source::Nintendo, id), payload)))
}

fn page_from_body(body: SolrBody, start: u64, today: NaiveDate) -> Result<Page, SourceError> {
    let returned = body.docs.len() as u64;
    let mut entries = Vec::with_capacity(body.docs.len());
    for (position, doc) in (0u64..).zip(body.docs) {
        if let Some(item) = item_from_doc(doc, today)? {
            entries.push((position, item));
        }
    }
    let end = start + returned;
    let next = (returned > 0 && end < body.num_found).then_some(CollectionCursor::Offset(end));
    Ok(Page::from_positions(entries, returned, next))
}

#[async_trait]
impl CatalogSource for NintendoCatalog {
    fn source(&self) -> Source {
        Source::Nintendo
    }

    fn paging(&self) -> PagingMode {
        PagingMode::Offset
    }

    async fn list_page(
        &self,
        cursor: &CollectionCursor,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let start = offset_of(cursor)?;
        let body = self.select("type:GAME", start, page_size).await?;
        page_from_body(body, start, Utc::now().date_naive())
    }

    async fn fetch_one(&self, external_id: &str) -> Result<CatalogItem, SourceError> {
        let doc = self.fetch_doc(external_id).await?;
        item_from_doc(doc, Utc::now().date_naive())?.ok_or(SourceError::NotFound)
    }

    async fn fetch_nested(&self, external_id: &str) -> Result<Vec<Tag>, SourceError> {
        let item = self.fetch_one(external_id).await?;
        let mut tags: Vec<Tag> = item.payload.categories.into_iter().map(Tag::new).collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[test]
    fn maps_released_game() {
        let doc = json!({
            "fs_id": "1173782",
            "title": "The Legend of Zelda: Tears of the Kingdom",
            "publisher": "Nintendo",
            "excerpt": "An epic adventure across the land and skies of Hyrule",
            "date_from": "2023-05-12T00:00:00Z",
            "pretty_date_s": "12/05/2023",
            "price_regular_f": 69.99,
            "price_discounted_f": 0.0,
            "pretty_game_categories_txt": ["Action", "Adventure"]
        });
        let item = item_from_doc(doc.clone(), today()).unwrap().unwrap();
        assert_eq!(item.key, RecordKey::new(Source::Nintendo, "1173782"));
        assert_eq!(item.payload.release.date_text.as_deref(), Some("2023-05-12"));
        assert!(!item.payload.release.coming_soon);
        let price = item.payload.price.as_ref().unwrap();
        assert_eq!(price.initial_minor, Some(6999));
        assert_eq!(price.final_minor, Some(6999));
        assert_eq!(item.payload.is_free, Some(false));
        assert_eq!(item.payload.publishers, vec!["Nintendo"]);
        assert_eq!(item.payload.extra, doc);
        assert!(item.is_game());
    }

    #[test]
    fn future_dates_are_coming_soon() {
        let doc = json!({"fs_id": 42, "title": "Metroid Prime 4", "date_from": "2025-12-04T00:00:00Z"});
        let item = item_from_doc(doc, today()).unwrap().unwrap();
        assert_eq!(item.key.external_id, "42");
        assert!(item.payload.release.coming_soon);
        assert_eq!(item.lifecycle_state(), crate::model::LifecycleState::PendingRelease);
    }

    #[test]
    fn falls_back_to_pretty_date_and_raw_categories() {
        let doc = json!({"fs_id": "7", "title": "X", "pretty_date_s": "TBD",
            "game_categories_txt": ["puzzle"]});
        let item = item_from_doc(doc, today()).unwrap().unwrap();
        assert_eq!(item.payload.release.date_text.as_deref(), Some("TBD"));
        assert!(!item.payload.release.coming_soon);
        assert_eq!(item.payload.categories, vec!["puzzle"]);
        assert_eq!(item.payload.price, None);
    }

    #[test]
    fn docs_without_id_are_dropped() {
        assert_eq!(item_from_doc(json!({"title": "orphan"}), today()).unwrap(), None);
    }

    #[test]
    fn pages_by_offset_until_num_found() {
        let body = SolrBody {
            num_found: 5,
            docs: vec![json!({"fs_id": "1", "title": "a"}), json!({"fs_id": "2", "title": "b"})],
        };
        let page = page_from_body(body, 2, today()).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next, Some(CollectionCursor::Offset(4)));

        let last = SolrBody { num_found: 5, docs: vec![json!({"fs_id": "5", "title": "e"})] };
        assert_eq!(page_from_body(last, 4, today()).unwrap().next, None);
        let empty = SolrBody { num_found: 5, docs: vec![] };
        assert_eq!(page_from_body(empty, 5, today()).unwrap().next, None);
    }

    #[test]
    fn truncating_after_dropped_docs_advances_past_them() {
        let body = SolrBody {
            num_found: 100,
            docs: vec![
                json!({"title": "orphan"}),
                json!({"fs_id": "11", "title": "a"}),
                json!({"title": "orphan"}),
                json!({"fs_id": "12", "title": "b"}),
            ],
        };
        let page = page_from_body(body, 40, today()).unwrap();
        assert_eq!(page.items.len(), 2);
        let from = CollectionCursor::Offset(40);
        assert_eq!(PagingMode::Offset.advance(&from, &page, 1), CollectionCursor::Offset(42));
        assert_eq!(PagingMode::Offset.advance(&from, &page, 2), CollectionCursor::Offset(44));
    }

    #[test]
    fn identifier_cursors_are_rejected() {
        assert!(offset_of(&CollectionCursor::After("9".into())).is_err());
        assert_eq!(offset_of(&CollectionCursor::Offset(300)), Ok(300));
    }
}
