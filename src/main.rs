use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use game_sync::catalog_for;
use game_sync::database_ops::memory::MemoryStore;
use game_sync::database_ops::postgres::PgStore;
use game_sync::database_ops::store::Store;
use game_sync::model::{CollectionCursor, Source};
use game_sync::sync::config::SyncConfig;
use game_sync::sync::pipeline::{Pipeline, RunOutcome, RunSummary, Stages};
use game_sync::sync::staleness::{StalenessAnchor, StalenessWindow};
use game_sync::util::db::Db;
use game_sync::util::env;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "game-sync", version, about = "Storefront catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Collect, migrate stale pending releases, and refresh recent releases if enabled
    Run(SyncArgs),
    /// Collect and reconcile the catalog listing only
    Collect(SyncArgs),
    /// Refetch stale pending-release records through the staging relation
    Migrate(SyncArgs),
    /// Refetch recently released games to update review statistics
    RefreshReviews(SyncArgs),
    /// Print rows currently held in the staging relation
    Staging {
        #[command(flatten)]
        db: DbArgs,
        /// Catalog whose staged rows to list
        #[arg(long, default_value = "steam")]
        source: Source,
    },
    /// Apply pending SQL migrations
    MigrateDb {
        #[command(flatten)]
        db: DbArgs,
        /// Directory holding NNNN_description.sql files
        #[arg(long, default_value = "./migrations")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct DbArgs {
    /// Optional override for the database URL
    #[arg(long)]
    db_url: Option<String>,
    /// Max pool connections (defaults to DB_MAX_CONNS or 5)
    #[arg(long)]
    max_connections: Option<u32>,
}

impl DbArgs {
    fn max_connections(&self) -> u32 {
        self.max_connections
            .unwrap_or_else(|| env::env_parse("DB_MAX_CONNS", 5u32))
    }
}

#[derive(Args, Debug, Clone)]
struct SyncArgs {
    #[command(flatten)]
    db: DbArgs,
    /// Catalog to sync (steam | nintendo)
    #[arg(long)]
    source: Option<Source>,
    /// Where collection starts: start, offset:N or after:ID
    #[arg(long)]
    start_cursor: Option<CollectionCursor>,
    /// Start after the highest identifier already stored
    #[arg(long, default_value_t = false)]
    resume_from_store: bool,
    /// Stop collecting after this many listed items
    #[arg(long)]
    max_items: Option<usize>,
    #[arg(long)]
    page_size: Option<usize>,
    /// Skip the per-record tag fetch
    #[arg(long, default_value_t = false)]
    no_nested: bool,
    /// Release window for refresh-reviews, in days
    #[arg(long)]
    days_back: Option<i64>,
    /// Pending-release records unchecked for this many days are migrated
    #[arg(long)]
    staleness_days: Option<i64>,
    /// Anchor for the staleness window (start-of-day | now)
    #[arg(long)]
    staleness_anchor: Option<StalenessAnchor>,
    #[arg(long)]
    migration_limit: Option<usize>,
    /// Also retry staged rows that previously gave up
    #[arg(long, default_value_t = false)]
    retry_failed: bool,
    #[arg(long)]
    rate_limit: Option<f64>,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Refresh recently released games after migrating (run only)
    #[arg(long, default_value_t = false)]
    refresh_reviews: bool,
    /// Run against an in-memory store; nothing is written to the database
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Print the run summary as JSON on stdout
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl SyncArgs {
    fn apply(&self, cfg: &mut SyncConfig) {
        if let Some(source) = self.source {
            cfg.source = source;
        }
        if let Some(cursor) = &self.start_cursor {
            cfg.start_cursor = cursor.clone();
        }
        if self.resume_from_store {
            cfg.resume_from_store = true;
        }
        if self.max_items.is_some() {
            cfg.max_items = self.max_items;
        }
        if let Some(n) = self.page_size {
            cfg.page_size = n;
        }
        if self.no_nested {
            cfg.fetch_nested = false;
        }
        if let Some(d) = self.days_back {
            cfg.days_back = d;
        }
        let anchor = self.staleness_anchor.unwrap_or(cfg.staleness.anchor);
        let days = self.staleness_days.unwrap_or(cfg.staleness.days);
        cfg.staleness = StalenessWindow::new(days, anchor);
        if let Some(n) = self.migration_limit {
            cfg.migration_limit = n;
        }
        if self.retry_failed {
            cfg.retry_failed = true;
        }
        if let Some(rps) = self.rate_limit {
            cfg.rate_limit_per_second = rps;
        }
        if let Some(n) = self.max_retries {
            cfg.max_retries = n;
        }
        if self.refresh_reviews {
            cfg.refresh_reviews = true;
        }
    }
}

async fn connect(args: &DbArgs) -> Result<Db> {
    let url = match &args.db_url {
        Some(u) => env::prefer_session_mode(u),
        None => env::db_url().context("set SUPABASE_DB_URL or DATABASE_URL, or pass --db-url")?,
    };
    Db::connect(&url, args.max_connections()).await
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("source:            {}", summary.source);
    println!("start cursor:      {}", summary.start_cursor);
    println!("confirmed cursor:  {}", summary.last_confirmed_cursor);
    println!("pages:             {}", summary.pages);
    println!(
        "processed:         {} (ok {}, failed {}, inserted {}, updated {}, skipped {})",
        summary.processed,
        summary.succeeded,
        summary.failed,
        summary.inserted,
        summary.updated,
        summary.skipped
    );
    if let Some(report) = &summary.migration {
        println!(
            "migration:         selected {}, moved {}, recovered {}, reinserted {}, failed {}",
            report.selected,
            report.moved,
            report.recovered,
            report.reinserted,
            report.failed()
        );
    }
    if let Some(err) = &summary.collection_error {
        println!("collection error:  {err}");
    }
    if let Some(err) = &summary.migration_error {
        println!("migration error:   {err}");
    }
    if let Some(err) = &summary.refresh_error {
        println!("refresh error:     {err}");
    }
    for failure in summary.failures.iter().take(20) {
        println!("  failed {}: {}", failure.key, failure.reason);
    }
    if summary.failures.len() > 20 {
        println!("  ... {} more", summary.failures.len() - 20);
    }
    Ok(())
}

async fn run_sync(args: SyncArgs, stages: Stages) -> Result<()> {
    let mut cfg = SyncConfig::from_env().context("invalid SYNC_* configuration")?;
    args.apply(&mut cfg);
    let stages = if stages.collect && stages.migrate {
        Stages {
            refresh: cfg.refresh_reviews,
            ..stages
        }
    } else {
        stages
    };

    let store: Arc<dyn Store> = if args.dry_run {
        warn!("dry run: using an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(PgStore::new(connect(&args.db).await?.pool))
    };
    let catalog = catalog_for(cfg.source)?;
    info!(source = %cfg.source, cursor = %cfg.start_cursor, ?stages, "starting sync");

    let summary = Pipeline::new(store, catalog, cfg).run_stages(stages).await;
    print_summary(&summary, args.json)?;
    if let RunOutcome::Aborted { reason } = &summary.outcome {
        bail!(
            "run aborted ({reason}); resume with --start-cursor {}",
            summary.last_confirmed_cursor
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    let cli = Cli::parse();
    let json = matches!(
        &cli.command,
        Commands::Run(a) | Commands::Collect(a) | Commands::Migrate(a) | Commands::RefreshReviews(a)
            if a.json
    );
    game_sync::logging::init_tracing("info,sqlx=warn", json)?;

    match cli.command {
        Commands::Run(args) => run_sync(args, Stages::ALL).await,
        Commands::Collect(args) => run_sync(args, Stages::COLLECT).await,
        Commands::Migrate(args) => run_sync(args, Stages::MIGRATE).await,
        Commands::RefreshReviews(args) => run_sync(args, Stages::REFRESH).await,
        Commands::Staging { db, source } => {
            let store = PgStore::new(connect(&db).await?.pool);
            let rows = store.staged_records(source).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Commands::MigrateDb { db, dir } => {
            let url = match &db.db_url {
                Some(u) => env::prefer_session_mode(u),
                None => env::db_url()?,
            };
            let conn = Db::connect_no_migrate(&url, db.max_connections()).await?;
            let applied = conn.run_migrations(&dir).await?;
            info!(count = applied.len(), ?applied, "migrations applied");
            Ok(())
        }
    }
}
