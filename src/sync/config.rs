use std::time::Duration;

use serde::Serialize;

use crate::model::{CollectionCursor, Source};
use crate::sync::collector::CollectorOptions;
use crate::sync::rate_limiter::RateLimitSettings;
use crate::sync::refresh::RefreshOptions;
use crate::sync::retry::RetryPolicy;
use crate::sync::staging::MigrationOptions;
use crate::sync::staleness::{StalenessAnchor, StalenessWindow};
use crate::util::env::{env_flag, env_opt, env_parse, env_parse_opt};

/// Everything one sync run needs, resolved from the environment and then CLI overrides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncConfig {
    pub source: Source,
    pub start_cursor: CollectionCursor,
    /// Derive the start cursor from the highest stored identifier instead.
    pub resume_from_store: bool,
    pub max_items: Option<usize>,
    pub page_size: usize,
    pub fetch_nested: bool,
    pub days_back: i64,
    pub staleness: StalenessWindow,
    pub migration_limit: usize,
    pub retry_failed: bool,
    pub rate_limit_per_second: f64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub reset_after_successes: u32,
    pub refresh_reviews: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: Source::Steam,
            start_cursor: CollectionCursor::Start,
            resume_from_store: false,
            max_items: None,
            page_size: 100,
            fetch_nested: true,
            days_back: 30,
            staleness: StalenessWindow::default(),
            migration_limit: 1000,
            retry_failed: false,
            rate_limit_per_second: 2.0,
            max_retries: 3,
            retry_base_ms: 500,
            backoff_ceiling_ms: 120_000,
            reset_after_successes: 5,
            refresh_reviews: false,
        }
    }
}

impl SyncConfig {
    /// Read `SYNC_*` variables over the defaults. Unparseable values fall back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        let source = match env_opt("SYNC_SOURCE") {
            Some(raw) => raw.parse::<Source>().map_err(anyhow::Error::msg)?,
            None => d.source,
        };
        let start_cursor = match env_opt("SYNC_START_CURSOR") {
            Some(raw) => raw.parse::<CollectionCursor>().map_err(anyhow::Error::msg)?,
            None => d.start_cursor,
        };
        let anchor = match env_opt("SYNC_STALENESS_ANCHOR") {
            Some(raw) => raw.parse::<StalenessAnchor>().map_err(anyhow::Error::msg)?,
            None => d.staleness.anchor,
        };
        Ok(Self {
            source,
            start_cursor,
            resume_from_store: env_flag("SYNC_RESUME_FROM_STORE", d.resume_from_store),
            max_items: env_parse_opt("SYNC_MAX_ITEMS"),
            page_size: env_parse("SYNC_PAGE_SIZE", d.page_size),
            fetch_nested: env_flag("SYNC_FETCH_NESTED", d.fetch_nested),
            days_back: env_parse("SYNC_DAYS_BACK", d.days_back),
            staleness: StalenessWindow::new(env_parse("SYNC_STALENESS_DAYS", d.staleness.days), anchor),
            migration_limit: env_parse("SYNC_MIGRATION_LIMIT", d.migration_limit),
            retry_failed: env_flag("SYNC_RETRY_FAILED", d.retry_failed),
            rate_limit_per_second: env_parse("SYNC_RATE_LIMIT_RPS", d.rate_limit_per_second),
            max_retries: env_parse("SYNC_MAX_RETRIES", d.max_retries),
            retry_base_ms: env_parse("SYNC_RETRY_BASE_MS", d.retry_base_ms),
            backoff_ceiling_ms: env_parse("SYNC_BACKOFF_CEILING_MS", d.backoff_ceiling_ms),
            reset_after_successes: env_parse("SYNC_BACKOFF_RESET_AFTER", d.reset_after_successes),
            refresh_reviews: env_flag("SYNC_REFRESH_REVIEWS", d.refresh_reviews),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            ceiling: Duration::from_millis(self.backoff_ceiling_ms),
        }
    }

    pub fn rate_limit(&self) -> RateLimitSettings {
        RateLimitSettings {
            requests_per_second: self.rate_limit_per_second,
            backoff_ceiling: Duration::from_millis(self.backoff_ceiling_ms),
            reset_after_successes: self.reset_after_successes,
        }
    }

    pub fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            page_size: self.page_size.max(1),
            max_items: self.max_items,
            fetch_nested: self.fetch_nested,
            retry: self.retry_policy(),
        }
    }

    pub fn migration_options(&self) -> MigrationOptions {
        MigrationOptions {
            staleness: self.staleness,
            limit: self.migration_limit,
            retry_failed: self.retry_failed,
            fetch_nested: self.fetch_nested,
            retry: self.retry_policy(),
        }
    }

    pub fn refresh_options(&self) -> RefreshOptions {
        RefreshOptions {
            days_back: self.days_back,
            limit: self.migration_limit,
            fetch_nested: self.fetch_nested,
            retry: self.retry_policy(),
        }
    }
}
