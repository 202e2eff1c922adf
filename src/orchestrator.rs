use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::database_ops::catalog::{CatalogError, CatalogPage, RemoteCatalogClient};
use crate::database_ops::db::Db;
use crate::database_ops::products::ProductUpsertStore;
use crate::database_ops::sync_runs::{BeginRun, RunCounters, RunStatus, SyncRun, SyncRunStore};
use crate::util::env::{env_flag, env_parse};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retries of the same cursor after `RateLimited` before the run fails.
    pub max_rate_limit_retries: u32,
    /// Upper bound on any single provider-suggested wait.
    pub max_backoff: Duration,
    /// Bound on one `fetch_page` call; expiry fails the run.
    pub page_timeout: Duration,
    pub max_pages: i64,
    /// `running` rows with an older heartbeat are failed before a new run starts.
    pub stale_run_after: Option<Duration>,
    pub record_sku_log: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 5,
            max_backoff: Duration::from_secs(60),
            page_timeout: Duration::from_secs(45),
            max_pages: 10_000,
            stale_run_after: Some(Duration::from_secs(30 * 60)),
            record_sku_log: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let stale_secs: u64 = env_parse(
            "CATALOG_STALE_RUN_SECS",
            d.stale_run_after.map(|s| s.as_secs()).unwrap_or(0),
        );
        Self {
            max_rate_limit_retries: env_parse(
                "CATALOG_MAX_RATE_LIMIT_RETRIES",
                d.max_rate_limit_retries,
            ),
            max_backoff: Duration::from_millis(env_parse(
                "CATALOG_MAX_BACKOFF_MS",
                d.max_backoff.as_millis() as u64,
            )),
            page_timeout: Duration::from_secs(env_parse(
                "CATALOG_PAGE_TIMEOUT_SECS",
                d.page_timeout.as_secs(),
            )),
            max_pages: env_parse("CATALOG_MAX_PAGES", d.max_pages),
            stale_run_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
            record_sku_log: env_flag("CATALOG_SKU_LOG", d.record_sku_log),
        }
    }
}

/// Structured outcome of one `run_incremental_sync` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSummary {
    pub status: RunStatus,
    pub run_id: i64,
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
    pub rate_limit_hits: i64,
    pub pages: i64,
    pub start_cursor: Option<String>,
    pub api_cursor: Option<String>,
    pub error: Option<String>,
}

impl SyncSummary {
    fn from_run(run: &SyncRun) -> Self {
        Self {
            status: run.status,
            run_id: run.id,
            processed: run.counters.processed,
            created: run.counters.created,
            updated: run.counters.updated,
            failed: run.counters.failed,
            rate_limit_hits: run.counters.rate_limit_hits,
            pages: run.counters.pages_committed,
            start_cursor: run.start_cursor.clone(),
            api_cursor: run.api_cursor.clone(),
            error: run.error_message.clone(),
        }
    }
}

/// Run-level errors. Provider and page failures never surface here; they end the
/// run as `failed` and come back as a [`SyncSummary`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync run {run_id} is already running")]
    AlreadyRunning { run_id: i64 },
    #[error("sync bookkeeping failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

enum Fetched {
    Page(CatalogPage),
    Stopped(RunStatus),
    Fatal(String),
}

enum LoopExit {
    Completed,
    Failed(String),
    /// The row left `running` from outside (cancelled, abandoned); it is final.
    Stopped(RunStatus),
}

pub struct SyncOrchestrator {
    client: Arc<dyn RemoteCatalogClient>,
    products: ProductUpsertStore,
    runs: SyncRunStore,
    cfg: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(client: Arc<dyn RemoteCatalogClient>, db: Db, cfg: SyncConfig) -> Self {
        Self {
            client,
            products: ProductUpsertStore::new(db.clone()),
            runs: SyncRunStore::new(db),
            cfg,
        }
    }

    pub fn runs(&self) -> &SyncRunStore {
        &self.runs
    }

    pub fn products(&self) -> &ProductUpsertStore {
        &self.products
    }

    /// Pull pages from the provider starting at the last completed run's cursor and
    /// reconcile them until the listing is exhausted, the run is cancelled, or a
    /// non-retryable failure stops it.
    #[instrument(skip(self), fields(client = self.client.name()))]
    pub async fn run_incremental_sync(&self, triggered_by: &str) -> Result<SyncSummary, SyncError> {
        if let Some(max_age) = self.cfg.stale_run_after {
            let max_age = chrono::Duration::from_std(max_age).context("stale_run_after out of range")?;
            self.runs.abandon_stale(max_age).await?;
        }

        let start_cursor = self.runs.latest_completed_cursor().await?;
        let run = match self
            .runs
            .begin_run(triggered_by, start_cursor.as_deref())
            .await?
        {
            BeginRun::Started(run) => run,
            BeginRun::AlreadyRunning { run_id } => {
                warn!(active_run_id = run_id, "sync already running; rejecting new run");
                return Err(SyncError::AlreadyRunning { run_id });
            }
        };

        let mut counters = RunCounters::default();
        let mut cursor = start_cursor;
        let exit = match self.drive(run.id, &mut cursor, &mut counters).await {
            Ok(exit) => exit,
            Err(e) => LoopExit::Failed(format!("{e:#}")),
        };

        let finished_here = match exit {
            LoopExit::Completed => {
                self.runs
                    .finish(run.id, RunStatus::Completed, &counters, None)
                    .await?
            }
            LoopExit::Failed(msg) => {
                self.runs
                    .finish(run.id, RunStatus::Failed, &counters, Some(&msg))
                    .await?
            }
            LoopExit::Stopped(status) => {
                debug!(run_id = run.id, %status, "run finalized outside the sync loop");
                false
            }
        };
        if !finished_here {
            // A cancellation that landed while the last page was in flight still gets
            // that page's progress; any other external terminal state is left as is.
            self.runs
                .settle_cancelled(run.id, cursor.as_deref(), &counters)
                .await?;
        }

        let finished = self
            .runs
            .get(run.id)
            .await?
            .context("sync run row missing after finish")?;
        let summary = SyncSummary::from_run(&finished);
        match summary.status {
            RunStatus::Failed => error!(
                run_id = summary.run_id,
                processed = summary.processed,
                api_cursor = ?summary.api_cursor,
                error = summary.error.as_deref().unwrap_or(""),
                "catalog sync failed; committed progress preserved"
            ),
            _ => info!(
                run_id = summary.run_id,
                status = %summary.status,
                processed = summary.processed,
                created = summary.created,
                updated = summary.updated,
                failed = summary.failed,
                rate_limit_hits = summary.rate_limit_hits,
                "catalog sync finished"
            ),
        }
        Ok(summary)
    }

    async fn drive(
        &self,
        run_id: i64,
        cursor: &mut Option<String>,
        counters: &mut RunCounters,
    ) -> anyhow::Result<LoopExit> {
        loop {
            if let Some(status) = self.stopped_externally(run_id).await? {
                info!(run_id, %status, "sync run finalized externally; stopping before next page");
                return Ok(LoopExit::Stopped(status));
            }
            if counters.pages_committed >= self.cfg.max_pages {
                return Ok(LoopExit::Failed(format!(
                    "page limit of {} reached before the listing ended",
                    self.cfg.max_pages
                )));
            }

            let page = match self.fetch_with_retry(run_id, cursor.as_deref(), counters).await? {
                Fetched::Page(page) => page,
                Fetched::Stopped(status) => return Ok(LoopExit::Stopped(status)),
                Fetched::Fatal(msg) => return Ok(LoopExit::Failed(msg)),
            };
            if page.has_more && page.next_cursor.is_none() {
                return Ok(LoopExit::Failed(
                    "provider reported more pages without a continuation cursor".into(),
                ));
            }

            let reconciled = self
                .products
                .reconcile_page(&page.records)
                .await
                .with_context(|| format!("page commit failed at cursor {cursor:?}"))?;
            counters.processed += page.records.len() as i64;
            counters.created += reconciled.created;
            counters.updated += reconciled.updated;
            counters.failed += reconciled.failed;
            counters.pages_committed += 1;

            if self.cfg.record_sku_log {
                if let Err(e) = self
                    .runs
                    .record_sku_outcomes(run_id, &reconciled.outcomes)
                    .await
                {
                    warn!(run_id, error = %e, "failed to write sku audit log");
                }
            }

            // Cursor advances only now that the page is durable. A final page without a
            // cursor keeps the previous one so the next run re-reads the tail.
            if let Some(next) = page.next_cursor {
                *cursor = Some(next);
            }
            if !self
                .runs
                .record_page(run_id, cursor.as_deref(), counters)
                .await?
            {
                let status = self.current_status(run_id).await?;
                warn!(run_id, %status, "sync run finalized externally during page; stopping");
                return Ok(LoopExit::Stopped(status));
            }
            info!(
                run_id,
                page = counters.pages_committed,
                records = page.records.len(),
                created = reconciled.created,
                updated = reconciled.updated,
                failed = reconciled.failed,
                cursor = ?cursor,
                "catalog page committed"
            );

            if !page.has_more {
                return Ok(LoopExit::Completed);
            }

            if page.rate_limit_remaining == 0 && page.rate_limit_reset_ms > 0 {
                let wait = self.bounded(page.rate_limit_reset_ms as u64);
                debug!(run_id, wait_ms = wait.as_millis() as u64, "rate-limit budget spent; pausing");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Fetch one page, retrying the same cursor on `RateLimited` up to the configured cap.
    async fn fetch_with_retry(
        &self,
        run_id: i64,
        cursor: Option<&str>,
        counters: &mut RunCounters,
    ) -> anyhow::Result<Fetched> {
        let mut retries = 0u32;
        loop {
            let fetched = tokio::time::timeout(self.cfg.page_timeout, self.client.fetch_page(cursor))
                .await
                .unwrap_or_else(|_| {
                    Err(CatalogError::Timeout {
                        after_ms: self.cfg.page_timeout.as_millis() as u64,
                    })
                });

            let err = match fetched {
                Ok(page) => return Ok(Fetched::Page(page)),
                Err(e) => e,
            };
            match err.retry_after_ms() {
                Some(retry_after_ms) => {
                    counters.rate_limit_hits += 1;
                    if retries >= self.cfg.max_rate_limit_retries {
                        return Ok(Fetched::Fatal(format!(
                            "rate limited {} times at cursor {cursor:?}; retries exhausted",
                            retries + 1
                        )));
                    }
                    retries += 1;
                    let wait = self.bounded(retry_after_ms);
                    warn!(
                        run_id,
                        cursor = ?cursor,
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                        "catalog provider rate limited; backing off"
                    );
                    if !self.runs.heartbeat(run_id, counters.rate_limit_hits).await? {
                        return Ok(Fetched::Stopped(self.current_status(run_id).await?));
                    }
                    tokio::time::sleep(wait).await;
                    if let Some(status) = self.stopped_externally(run_id).await? {
                        return Ok(Fetched::Stopped(status));
                    }
                }
                None => {
                    warn!(run_id, cursor = ?cursor, error = %err, "catalog page fetch failed");
                    return Ok(Fetched::Fatal(err.to_string()));
                }
            }
        }
    }

    fn bounded(&self, ms: u64) -> Duration {
        Duration::from_millis(ms).min(self.cfg.max_backoff)
    }

    async fn current_status(&self, run_id: i64) -> anyhow::Result<RunStatus> {
        self.runs
            .status(run_id)
            .await?
            .with_context(|| format!("sync run {run_id} row missing"))
    }

    /// Terminal status of a run that something other than this loop finalized.
    async fn stopped_externally(&self, run_id: i64) -> anyhow::Result<Option<RunStatus>> {
        let status = self.current_status(run_id).await?;
        Ok((status != RunStatus::Running).then_some(status))
    }
}
