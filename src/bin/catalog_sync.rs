use anyhow::{bail, Context, Result};
use catalog_sync::database_ops::catalog::{
    HttpCatalogClient, HttpCatalogConfig, RemoteCatalogClient, ScriptedCatalogClient,
};
use catalog_sync::database_ops::db::Db;
use catalog_sync::database_ops::products::ProductUpsertStore;
use catalog_sync::database_ops::sync_runs::SyncRunStore;
use catalog_sync::orchestrator::{SyncConfig, SyncError, SyncOrchestrator, SyncSummary};
use catalog_sync::snapshot::build_quote_snapshot;
use catalog_sync::util::env;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "catalog_sync", version, about = "Product catalog sync CLI")]
struct Cli {
    /// Optional override for the database URL
    #[arg(long, global = true)]
    db_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run an incremental sync (once, or every --interval-secs)
    Run {
        #[arg(long, default_value = "cli")]
        triggered_by: String,
        /// Repeat forever with this pause between runs (0 = run once)
        #[arg(long, default_value_t = 0)]
        interval_secs: u64,
        /// Replay a JSON fixture instead of calling the provider
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Show recent sync runs
    Status {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Acknowledge a failed run so its cursor becomes the next starting point
    Resolve { run_id: i64 },
    /// Cancel a running sync; it stops before its next page fetch
    Cancel { run_id: i64 },
    /// Fail running syncs whose heartbeat is older than the threshold
    AbandonStale {
        #[arg(long, default_value_t = 1800)]
        older_than_secs: i64,
    },
    /// Print the per-SKU audit log of a run
    SkuLog { run_id: i64 },
    /// Print a quote snapshot for a SKU as JSON
    Snapshot { sku: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env::bootstrap_cli("catalog_sync");
    catalog_sync::tracing::init_tracing(catalog_sync::tracing::DEFAULT_FILTER)?;
    let cli = Cli::parse();

    let db_url = cli.db_url.clone().unwrap_or_else(env::db_url);
    let db = Db::connect(&db_url, env::env_parse("DB_MAX_CONNS", 5u32))
        .await
        .with_context(|| format!("connect {}", env::redact_value("DATABASE_URL", &db_url)))?;

    match cli.command {
        Commands::Run {
            triggered_by,
            interval_secs,
            fixture,
        } => {
            let client: Arc<dyn RemoteCatalogClient> = match fixture {
                Some(path) => Arc::new(ScriptedCatalogClient::from_fixture_file(&path)?),
                None => {
                    env::preflight_check(
                        "catalog_sync",
                        &["CATALOG_API_BASE_URL"],
                        &["CATALOG_API_BASE_URL", "CATALOG_API_KEY", "CATALOG_PAGE_SIZE"],
                    )?;
                    Arc::new(HttpCatalogClient::new(HttpCatalogConfig::from_env()?)?)
                }
            };
            let orch = SyncOrchestrator::new(client, db, SyncConfig::from_env());
            run_loop(&orch, &triggered_by, interval_secs).await?;
        }
        Commands::Status { limit } => {
            let runs = SyncRunStore::new(db.clone()).list_recent(limit).await?;
            let products = ProductUpsertStore::new(db);
            println!(
                "[catalog_sync] products={} discontinued={}",
                products.count().await?,
                products.count_discontinued().await?
            );
            for r in runs {
                println!(
                    "#{:<5} {:<9} by={:<10} processed={} created={} updated={} failed={} rate_limited={} pages={} cursor={} started={}{}",
                    r.id,
                    r.status,
                    r.triggered_by,
                    r.counters.processed,
                    r.counters.created,
                    r.counters.updated,
                    r.counters.failed,
                    r.counters.rate_limit_hits,
                    r.counters.pages_committed,
                    r.api_cursor.as_deref().unwrap_or("-"),
                    r.started_at.to_rfc3339(),
                    r.error_message
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Resolve { run_id } => {
            if !SyncRunStore::new(db).mark_resolved(run_id).await? {
                bail!("run {run_id} is not a failed run");
            }
            println!("[catalog_sync] run {run_id} resolved");
        }
        Commands::Cancel { run_id } => {
            if !SyncRunStore::new(db).cancel(run_id).await? {
                bail!("run {run_id} is not running");
            }
            println!("[catalog_sync] run {run_id} cancellation requested");
        }
        Commands::AbandonStale { older_than_secs } => {
            let ids = SyncRunStore::new(db)
                .abandon_stale(chrono::Duration::seconds(older_than_secs.max(0)))
                .await?;
            println!("[catalog_sync] abandoned runs: {ids:?}");
        }
        Commands::SkuLog { run_id } => {
            for log in SyncRunStore::new(db).sku_logs(run_id).await? {
                println!(
                    "{} {:<8} sku={} external_id={}{}",
                    log.logged_at.to_rfc3339(),
                    log.outcome,
                    log.sku.as_deref().unwrap_or("-"),
                    log.external_id.as_deref().unwrap_or("-"),
                    log.error_detail
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Snapshot { sku } => {
            let product = ProductUpsertStore::new(db)
                .get_by_sku(&sku)
                .await?
                .with_context(|| format!("no product with sku {sku}"))?;
            let snapshot = build_quote_snapshot(&product);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}

async fn run_loop(orch: &SyncOrchestrator, triggered_by: &str, interval_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        let summary = orch.run_incremental_sync(triggered_by).await?;
        print_summary(&summary)?;
        return Ok(());
    }

    loop {
        match orch.run_incremental_sync(triggered_by).await {
            Ok(summary) => print_summary(&summary)?,
            Err(SyncError::AlreadyRunning { run_id }) => {
                warn!(run_id, "previous sync still running; skipping this tick")
            }
            Err(e) => error!(error = %e, "catalog sync errored"),
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received; stopping sync loop");
                return Ok(());
            }
        }
    }
}

fn print_summary(summary: &SyncSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}
