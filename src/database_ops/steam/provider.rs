use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::database_ops::catalog::{CatalogSource, Page, PagingMode};
use crate::database_ops::http::status_error;
use crate::error::SourceError;
use crate::model::{
    CatalogItem, CollectionCursor, GamePayload, Price, RecordKey, ReleaseInfo, ReviewSummary,
    Source, Tag,
};
use crate::util::env::env_opt;

const STEAM_API_BASE: &str = "https://api.steampowered.com";
const STEAM_STORE_BASE: &str = "https://store.steampowered.com";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Deserialize)]
struct StoreAppListResp {
    response: StoreAppList,
}

#[derive(Debug, Default, Deserialize)]
struct StoreAppList {
    #[serde(default)]
    apps: Vec<AppEntry>,
    #[serde(default)]
    have_more_results: bool,
    #[serde(default)]
    last_appid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LegacyAppListResp {
    applist: LegacyAppList,
}

#[derive(Debug, Deserialize)]
struct LegacyAppList {
    apps: Vec<AppEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AppEntry {
    appid: u64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AppDetailsWrapper {
    success: bool,
    data: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct AppData {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    is_free: Option<bool>,
    #[serde(default)]
    price_overview: Option<PriceOverview>,
    #[serde(default)]
    release_date: Option<ReleaseDate>,
    #[serde(default)]
    categories: Vec<Described>,
    #[serde(default)]
    genres: Vec<Described>,
    #[serde(default)]
    publishers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PriceOverview {
    currency: Option<String>,
    #[serde(rename = "initial")]
    initial_price: Option<i64>,
    #[serde(rename = "final")]
    final_price: Option<i64>,
    discount_percent: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ReleaseDate {
    #[serde(default)]
    coming_soon: bool,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Described {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewsResp {
    success: i64,
    query_summary: Option<QuerySummary>,
}

#[derive(Debug, Deserialize)]
struct QuerySummary {
    review_score: Option<i32>,
    review_score_desc: Option<String>,
    #[serde(default)]
    total_positive: i64,
    #[serde(default)]
    total_negative: i64,
    #[serde(default)]
    total_reviews: i64,
}

fn tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""tagid":\s*(\d+),\s*"name":\s*"([^"]+)""#).ok())
        .as_ref()
}

/// Steam storefront. Listing uses `IStoreService/GetAppList` when an API key is configured,
/// otherwise the public `ISteamApps/GetAppList/v2` dump sliced client-side.
pub struct SteamCatalog {
    client: Client,
    api_key: Option<String>,
    api_base: String,
    store_base: String,
}

impl SteamCatalog {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            api_base: STEAM_API_BASE.to_string(),
            store_base: STEAM_STORE_BASE.to_string(),
        }
    }

    /// Env: STEAM_API_KEY (optional), STEAM_API_BASE / STEAM_STORE_BASE (overrides).
    pub fn from_env() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        let mut catalog = Self::new(client, env_opt("STEAM_API_KEY"));
        if let Some(base) = env_opt("STEAM_API_BASE") {
            catalog.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(base) = env_opt("STEAM_STORE_BASE") {
            catalog.store_base = base.trim_end_matches('/').to_string();
        }
        Ok(catalog)
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, SourceError> {
        let resp = self.client.get(url).query(query).send().await?;
        if let Some(err) = status_error(resp.status(), resp.headers()) {
            debug!(url, status = resp.status().as_u16(), "steam request rejected");
            return Err(err);
        }
        Ok(resp)
    }

    async fn list_store_service(
        &self,
        key: &str,
        after: Option<u64>,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let url = format!("{}/IStoreService/GetAppList/v1/", self.api_base);
        let mut query = vec![
            ("key", key.to_string()),
            ("include_games", "true".to_string()),
            ("include_dlc", "false".to_string()),
            ("max_results", page_size.to_string()),
        ];
        if let Some(last) = after {
            query.push(("last_appid", last.to_string()));
        }
        let body: StoreAppListResp = self.get(&url, &query).await?.json().await?;
        Ok(page_from_store_list(body.response))
    }

    async fn list_legacy(&self, after: Option<u64>, page_size: usize) -> Result<Page, SourceError> {
        let url = format!("{}/ISteamApps/GetAppList/v2/", self.api_base);
        let body: LegacyAppListResp = self.get(&url, &[]).await?.json().await?;
        Ok(page_from_full_list(body.applist.apps, after, page_size))
    }

    async fn fetch_reviews(&self, app_id: &str) -> Result<Option<ReviewSummary>, SourceError> {
        let url = format!("{}/appreviews/{}", self.store_base, app_id);
        let query = [
            ("json", "1".to_string()),
            ("language", "all".to_string()),
            ("filter", "all".to_string()),
            ("review_type", "all".to_string()),
            ("purchase_type", "all".to_string()),
            ("num_per_page", "0".to_string()),
        ];
        let body: ReviewsResp = self.get(&url, &query).await?.json().await?;
        Ok(reviews_from_response(body))
    }
}

fn parse_app_cursor(cursor: &CollectionCursor) -> Result<Option<u64>, SourceError> {
    match cursor {
        CollectionCursor::Start => Ok(None),
        CollectionCursor::After(id) => id
            .parse::<u64>()
            .map(Some)
            .map_err(|_| SourceError::Decode(format!("steam cursor is not an app id: {id}"))),
        CollectionCursor::Offset(_) => Err(SourceError::Decode(
            "steam listing pages by app id, not offset".into(),
        )),
    }
}

fn listed_item(entry: &AppEntry) -> CatalogItem {
    CatalogItem::new(
        RecordKey::new(Source::Steam, entry.appid.to_string()),
        GamePayload {
            name: entry.name.clone(),
            ..GamePayload::default()
        },
    )
}

fn page_from_store_list(list: StoreAppList) -> Page {
    let items: Vec<CatalogItem> = list.apps.iter().map(listed_item).collect();
    let next = if list.have_more_results {
        list.last_appid
            .or_else(|| list.apps.last().map(|a| a.appid))
            .map(|id| CollectionCursor::After(id.to_string()))
    } else {
        None
    };
    Page::new(items, next)
}

fn page_from_full_list(mut apps: Vec<AppEntry>, after: Option<u64>, page_size: usize) -> Page {
    apps.retain(|a| after.map_or(true, |last| a.appid > last));
    apps.sort_by_key(|a| a.appid);
    apps.dedup_by_key(|a| a.appid);
    let has_more = apps.len() > page_size;
    apps.truncate(page_size);
    let items: Vec<CatalogItem> = apps.iter().map(listed_item).collect();
    let next = if has_more {
        apps.last().map(|a| CollectionCursor::After(a.appid.to_string()))
    } else {
        None
    };
    Page::new(items, next)
}

fn payload_from_details(data: Value) -> Result<GamePayload, SourceError> {
    let app: AppData = serde_json::from_value(data.clone())?;
    let mut categories: Vec<String> = app
        .categories
        .into_iter()
        .chain(app.genres)
        .filter_map(|d| d.description)
        .collect();
    categories.dedup();
    Ok(GamePayload {
        name: app.name.unwrap_or_default(),
        kind: app.kind,
        description: app.short_description,
        price: app.price_overview.map(|p| Price {
            currency: p.currency,
            initial_minor: p.initial_price,
            final_minor: p.final_price,
            discount_percent: p.discount_percent,
        }),
        is_free: app.is_free,
        release: app
            .release_date
            .map(|r| ReleaseInfo {
                coming_soon: r.coming_soon,
                date_text: r.date.filter(|d| !d.trim().is_empty()),
            })
            .unwrap_or_default(),
        categories,
        publishers: app.publishers,
        extra: data,
    })
}

fn reviews_from_response(body: ReviewsResp) -> Option<ReviewSummary> {
    if body.success != 1 {
        return None;
    }
    body.query_summary.map(|q| ReviewSummary {
        review_score: q.review_score,
        review_score_desc: q.review_score_desc,
        total_positive: q.total_positive,
        total_negative: q.total_negative,
        total_reviews: q.total_reviews,
    })
}

/// User tags embedded in the store page's inline JSON, in page order, without duplicates.
pub fn extract_tags(html: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    let Some(re) = tag_regex() else {
        return tags;
    };
    for caps in re.captures_iter(html) {
        let tag = Tag::new(caps[2].to_string());
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

#[async_trait]
impl CatalogSource for SteamCatalog {
    fn source(&self) -> Source {
        Source::Steam
    }

    fn paging(&self) -> PagingMode {
        PagingMode::AfterId
    }

    fn listing_is_complete(&self) -> bool {
        false
    }

    async fn list_page(
        &self,
        cursor: &CollectionCursor,
        page_size: usize,
    ) -> Result<Page, SourceError> {
        let after = parse_app_cursor(cursor)?;
        match &self.api_key {
            Some(key) => self.list_store_service(key, after, page_size).await,
            None => self.list_legacy(after, page_size).await,
        }
    }

    async fn fetch_one(&self, external_id: &str) -> Result<CatalogItem, SourceError> {
        let url = format!("{}/api/appdetails", self.store_base);
        let body: HashMap<String, AppDetailsWrapper> = self
            .get(&url, &[("appids", external_id.to_string())])
            .await?
            .json()
            .await?;
        let data = match body.into_iter().find(|(k, _)| k == external_id) {
            Some((_, AppDetailsWrapper { success: true, data: Some(data) })) => data,
            _ => return Err(SourceError::NotFound),
        };
        let payload = payload_from_details(data)?;
        let mut item = CatalogItem::new(RecordKey::new(Source::Steam, external_id), payload);

        match self.fetch_reviews(external_id).await {
            Ok(Some(reviews)) => item = item.with_reviews(reviews),
            Ok(None) => {}
            Err(err @ SourceError::Throttled { .. }) => return Err(err),
            Err(err) => warn!(app_id = external_id, error = %err, "review summary unavailable"),
        }
        Ok(item)
    }

    async fn fetch_nested(&self, external_id: &str) -> Result<Vec<Tag>, SourceError> {
        let url = format!("{}/app/{}/", self.store_base, external_id);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.5")
            .send()
            .await?;
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(status_error(resp.status(), resp.headers())
                .unwrap_or(SourceError::Throttled { retry_after: None }));
        }
        if !resp.status().is_success() {
            // delisted apps redirect or 404: no tags
            debug!(app_id = external_id, status = resp.status().as_u16(), "no store page");
            return Ok(Vec::new());
        }
        let html = resp.text().await?;
        Ok(extract_tags(&html))
    }
}
