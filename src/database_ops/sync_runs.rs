use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument, warn};

use crate::database_ops::db::Db;
use crate::database_ops::products::SkuOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(anyhow!("unknown sync run status `{other}`")),
        }
    }
}

/// Running totals for one run. Owned by the orchestrator for the run's duration and
/// written through on every page commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub processed: i64,
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
    pub rate_limit_hits: i64,
    pub pages_committed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub triggered_by: String,
    pub status: RunStatus,
    pub start_cursor: Option<String>,
    /// Last cursor committed after a durable page write; resume point for later runs.
    pub api_cursor: Option<String>,
    pub counters: RunCounters,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    fn from_row(r: &SqliteRow) -> Result<Self> {
        let status: String = r.try_get("status")?;
        Ok(Self {
            id: r.try_get("id")?,
            triggered_by: r.try_get("triggered_by")?,
            status: status.parse()?,
            start_cursor: r.try_get("start_cursor")?,
            api_cursor: r.try_get("api_cursor")?,
            counters: RunCounters {
                processed: r.try_get("processed")?,
                created: r.try_get("created")?,
                updated: r.try_get("updated")?,
                failed: r.try_get("failed")?,
                rate_limit_hits: r.try_get("rate_limit_hits")?,
                pages_committed: r.try_get("pages_committed")?,
            },
            error_message: r.try_get("error_message")?,
            started_at: r.try_get("started_at")?,
            heartbeat_at: r.try_get("heartbeat_at")?,
            completed_at: r.try_get("completed_at")?,
            resolved_at: r.try_get("resolved_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSkuLog {
    pub id: i64,
    pub run_id: i64,
    pub sku: Option<String>,
    pub external_id: Option<String>,
    pub outcome: String,
    pub error_detail: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// Result of trying to open a new run.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginRun {
    Started(SyncRun),
    AlreadyRunning { run_id: i64 },
}

#[derive(Clone)]
pub struct SyncRunStore {
    db: Db,
}

impl SyncRunStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// `api_cursor` of the most recent completed run; `None` when there is none
    /// (start from the beginning of the catalog).
    pub async fn latest_completed_cursor(&self) -> Result<Option<String>> {
        let cursor: Option<Option<String>> = sqlx::query_scalar(
            "SELECT api_cursor FROM sync_runs WHERE status = 'completed' ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(cursor.flatten())
    }

    pub async fn active_run(&self) -> Result<Option<SyncRun>> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE status = 'running' LIMIT 1")
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(SyncRun::from_row).transpose()
    }

    /// Insert a `running` row unless another run holds the slot. The partial unique
    /// index settles races between processes.
    #[instrument(skip(self))]
    pub async fn begin_run(
        &self,
        triggered_by: &str,
        start_cursor: Option<&str>,
    ) -> Result<BeginRun> {
        if let Some(active) = self.active_run().await? {
            return Ok(BeginRun::AlreadyRunning { run_id: active.id });
        }

        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO sync_runs (triggered_by, status, start_cursor, api_cursor, started_at, heartbeat_at)
             VALUES (?, 'running', ?, ?, ?, ?)",
        )
        .bind(triggered_by)
        .bind(start_cursor)
        .bind(start_cursor)
        .bind(now)
        .bind(now)
        .execute(&self.db.pool)
        .await;

        let id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let run_id = self.active_run().await?.map(|r| r.id).unwrap_or_default();
                return Ok(BeginRun::AlreadyRunning { run_id });
            }
            Err(e) => return Err(e).context("insert sync run"),
        };

        let run = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("sync run {id} vanished after insert"))?;
        info!(run_id = id, start_cursor = ?start_cursor, "sync run started");
        Ok(BeginRun::Started(run))
    }

    /// Persist progress after a page commit: cursor, counters and heartbeat together.
    /// Returns false once the run has left `running`; its row is then left alone.
    pub async fn record_page(
        &self,
        run_id: i64,
        api_cursor: Option<&str>,
        counters: &RunCounters,
    ) -> Result<bool> {
        self.write_progress(run_id, api_cursor, counters, RunStatus::Running)
            .await
    }

    /// Bring a cancelled run's counters and cursor up to date with the page that was
    /// in flight when the cancellation landed. No other terminal state is touched.
    pub async fn settle_cancelled(
        &self,
        run_id: i64,
        api_cursor: Option<&str>,
        counters: &RunCounters,
    ) -> Result<bool> {
        self.write_progress(run_id, api_cursor, counters, RunStatus::Cancelled)
            .await
    }

    async fn write_progress(
        &self,
        run_id: i64,
        api_cursor: Option<&str>,
        counters: &RunCounters,
        expected: RunStatus,
    ) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE sync_runs SET api_cursor = ?, processed = ?, created = ?, updated = ?,
                failed = ?, rate_limit_hits = ?, pages_committed = ?, heartbeat_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(api_cursor)
        .bind(counters.processed)
        .bind(counters.created)
        .bind(counters.updated)
        .bind(counters.failed)
        .bind(counters.rate_limit_hits)
        .bind(counters.pages_committed)
        .bind(Utc::now())
        .bind(run_id)
        .bind(expected.as_str())
        .execute(&self.db.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Bump the heartbeat (and rate-limit tally) while waiting out a backoff.
    /// Returns false once the run has left `running`.
    pub async fn heartbeat(&self, run_id: i64, rate_limit_hits: i64) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE sync_runs SET heartbeat_at = ?, rate_limit_hits = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(rate_limit_hits)
        .bind(run_id)
        .execute(&self.db.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn status(&self, run_id: i64) -> Result<Option<RunStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM sync_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.db.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    /// Move a running run to a terminal state. Returns false when the run had
    /// already left `running` (e.g. cancelled externally); terminal states are never
    /// overwritten.
    pub async fn finish(
        &self,
        run_id: i64,
        status: RunStatus,
        counters: &RunCounters,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("cannot finish run {run_id} as `{status}`"));
        }
        let now = Utc::now();
        let done = sqlx::query(
            "UPDATE sync_runs SET status = ?, processed = ?, created = ?, updated = ?,
                failed = ?, rate_limit_hits = ?, pages_committed = ?, error_message = ?,
                completed_at = ?, heartbeat_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(counters.processed)
        .bind(counters.created)
        .bind(counters.updated)
        .bind(counters.failed)
        .bind(counters.rate_limit_hits)
        .bind(counters.pages_committed)
        .bind(error_message)
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&self.db.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Operator acknowledgement of a failed run: failed → completed, which makes its
    /// committed cursor eligible as the next run's starting point.
    pub async fn mark_resolved(&self, run_id: i64) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE sync_runs SET status = 'completed', resolved_at = ?
             WHERE id = ? AND status = 'failed'",
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.db.pool)
        .await?;
        let resolved = done.rows_affected() == 1;
        if resolved {
            info!(run_id, "failed sync run marked resolved");
        }
        Ok(resolved)
    }

    /// Request cancellation; the orchestrator observes it before its next page fetch.
    pub async fn cancel(&self, run_id: i64) -> Result<bool> {
        let now = Utc::now();
        let done = sqlx::query(
            "UPDATE sync_runs SET status = 'cancelled', completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(now)
        .bind(run_id)
        .execute(&self.db.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Fail `running` rows whose heartbeat is older than `max_age` (the host process
    /// died mid-run). They are not resumed automatically; an operator resolves them.
    pub async fn abandon_stale(&self, max_age: Duration) -> Result<Vec<i64>> {
        let now = Utc::now();
        let cutoff = now - max_age;
        let rows = sqlx::query("SELECT id, heartbeat_at FROM sync_runs WHERE status = 'running'")
            .fetch_all(&self.db.pool)
            .await?;

        let mut abandoned = Vec::new();
        for r in rows {
            let id: i64 = r.try_get("id")?;
            let heartbeat_at: DateTime<Utc> = r.try_get("heartbeat_at")?;
            if heartbeat_at >= cutoff {
                continue;
            }
            let msg = format!("abandoned: no heartbeat since {}", heartbeat_at.to_rfc3339());
            let done = sqlx::query(
                "UPDATE sync_runs SET status = 'failed', error_message = ?, completed_at = ?
                 WHERE id = ? AND status = 'running'",
            )
            .bind(&msg)
            .bind(now)
            .bind(id)
            .execute(&self.db.pool)
            .await?;
            if done.rows_affected() == 1 {
                warn!(run_id = id, heartbeat_at = %heartbeat_at, "stale sync run marked failed");
                abandoned.push(id);
            }
        }
        Ok(abandoned)
    }

    pub async fn get(&self, run_id: i64) -> Result<Option<SyncRun>> {
        let row = sqlx::query("SELECT * FROM sync_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(SyncRun::from_row).transpose()
    }

    pub async fn latest(&self) -> Result<Option<SyncRun>> {
        Ok(self.list_recent(1).await?.into_iter().next())
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<SyncRun>> {
        let rows = sqlx::query("SELECT * FROM sync_runs ORDER BY id DESC LIMIT ?")
            .bind(limit.max(0))
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(SyncRun::from_row).collect()
    }

    /// Append the per-SKU audit trail for one page.
    pub async fn record_sku_outcomes(&self, run_id: i64, outcomes: &[SkuOutcome]) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self.db.pool.begin().await?;
        for o in outcomes {
            sqlx::query(
                "INSERT INTO sync_sku_logs (run_id, sku, external_id, outcome, error_detail, logged_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(&o.sku)
            .bind(&o.external_id)
            .bind(o.outcome.as_str())
            .bind(&o.error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn sku_logs(&self, run_id: i64) -> Result<Vec<SyncSkuLog>> {
        let rows = sqlx::query(
            "SELECT id, run_id, sku, external_id, outcome, error_detail, logged_at
             FROM sync_sku_logs WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(&self.db.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(SyncSkuLog {
                    id: r.try_get("id")?,
                    run_id: r.try_get("run_id")?,
                    sku: r.try_get("sku")?,
                    external_id: r.try_get("external_id")?,
                    outcome: r.try_get("outcome")?,
                    error_detail: r.try_get("error_detail")?,
                    logged_at: r.try_get("logged_at")?,
                })
            })
            .collect()
    }
}
