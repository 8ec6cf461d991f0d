use anyhow::Result;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Self::connect_no_migrate(database_url, max_connections).await?;

        // Optional auto-migrate gate (default: OFF).
        if env_flag("AUTO_MIGRATE", false) {
            info!("running migrations (AUTO_MIGRATE=on, custom runner)");
            db.run_migrations(Path::new("./migrations")).await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    // Variant that NEVER runs migrations regardless of env.
    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Apply every `NNNN_description.sql` file in `dir` not yet recorded in `_sqlx_migrations`.
    /// Returns the versions applied by this call.
    pub async fn run_migrations(&self, dir: &Path) -> Result<Vec<i64>> {
        let pool = &self.pool;
        if !dir.exists() {
            warn!(dir = %dir.display(), "migrations directory missing; nothing to apply");
            return Ok(Vec::new());
        }
        // raw_sql avoids prepared statements under PgBouncer
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(pool)
        .await?;
        let applied_rows = sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
            .fetch_all(pool)
            .await?;
        let mut applied: HashSet<i64> = HashSet::new();
        for r in applied_rows {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        let mut candidates: Vec<(i64, String, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some((version, desc)) = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(parse_migration_file_name)
            {
                candidates.push((version, desc, path));
            }
        }
        candidates.sort_by_key(|(v, _, _)| *v);

        let mut newly_applied = Vec::new();
        for (version, desc, path) in candidates {
            if applied.contains(&version) {
                continue;
            }
            let sql = std::fs::read_to_string(&path)?;
            info!(version, file = ?path, "applying migration (two-phase)");
            let (transactional, concurrent_indexes) = split_concurrent_indexes(&sql);
            let trimmed = transactional.trim();
            if !trimmed.is_empty() {
                sqlx::raw_sql(trimmed).execute(pool).await?;
            }
            // CREATE INDEX CONCURRENTLY cannot run inside the implicit transaction above
            for stmt in concurrent_indexes {
                info!(migration_version = version, index_stmt = %stmt, "creating concurrent index");
                if let Err(e) = sqlx::raw_sql(&stmt).execute(pool).await {
                    warn!(migration_version = version, error = %e, "concurrent index creation failed");
                    return Err(e.into());
                }
            }
            let insert_stmt = format!(
                "INSERT INTO _sqlx_migrations(version, description) VALUES ({}, '{}')",
                version,
                desc.replace('\'', "''")
            );
            sqlx::raw_sql(&insert_stmt).execute(pool).await?;
            applied.insert(version);
            newly_applied.push(version);
        }
        info!(applied = newly_applied.len(), "migrations up-to-date (custom)");
        Ok(newly_applied)
    }
}

/// `0001_sync_core.sql` -> `(1, "sync_core")`. Anything else is ignored by the runner.
fn parse_migration_file_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let desc = stem[digits.len()..].strip_prefix('_')?;
    let version = digits.parse::<i64>().ok()?;
    Some((version, desc.to_string()))
}

/// Separate `CREATE INDEX CONCURRENTLY` statements (each ending at the first `;`) from the
/// rest of a migration file.
fn split_concurrent_indexes(sql: &str) -> (String, Vec<String>) {
    let mut transactional = String::with_capacity(sql.len());
    let mut concurrent_indexes: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut capturing = false;
    for line in sql.lines() {
        let lt = line.trim_start().to_lowercase();
        if !capturing && lt.starts_with("create index concurrently") {
            capturing = true;
            buf.clear();
        }
        if capturing {
            buf.push_str(line);
            buf.push('\n');
            if line.contains(';') {
                capturing = false;
                concurrent_indexes.push(buf.trim().to_string());
                buf.clear();
            }
            continue;
        }
        transactional.push_str(line);
        transactional.push('\n');
    }
    (transactional, concurrent_indexes)
}
