pub mod database_ops;
pub mod error;
pub mod logging;
pub mod model;
pub mod normalization;
pub mod sync;

pub mod util {
    pub mod db;
    pub mod env;
}

use std::sync::Arc;

use database_ops::catalog::CatalogSource;
use database_ops::nintendo::provider::NintendoCatalog;
use database_ops::steam::provider::SteamCatalog;
use model::Source;

/// Build the catalog adapter for `source` from environment configuration.
pub fn catalog_for(source: Source) -> anyhow::Result<Arc<dyn CatalogSource>> {
    let catalog: Arc<dyn CatalogSource> = match source {
        Source::Steam => Arc::new(SteamCatalog::from_env()?),
        Source::Nintendo => Arc::new(NintendoCatalog::from_env()?),
    };
    Ok(catalog)
}
