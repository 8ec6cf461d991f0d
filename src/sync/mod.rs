//! The sync engine: pacing, resumable collection, reconciliation and the staging migration.
pub mod collector;
pub mod config;
pub mod pipeline;
pub mod rate_limiter;
pub mod reconciler;
pub mod refresh;
pub mod retry;
pub mod staging;
pub mod staleness;

#[cfg(test)]
pub(crate) mod testing;
