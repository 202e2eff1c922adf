use anyhow::{Context, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

/// Embedded schema migrations: (version, description, sql).
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "catalog_sync",
    include_str!("../../migrations/0001_catalog_sync.sql"),
)];

#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Self::connect_no_migrate(database_url, max_connections).await?;

        // Default ON here: the catalog tables are owned by this crate.
        // Disable with AUTO_MIGRATE=0 when the schema is managed elsewhere.
        if env_flag("AUTO_MIGRATE", true) {
            info!("running migrations (AUTO_MIGRATE=on)");
            db.migrate().await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    // Variant that NEVER runs migrations regardless of env.
    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .context("invalid sqlite database url")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("failed to open sqlite pool")?;
        info!("connected to db (no-migrate)");
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    ///
    /// An in-memory SQLite database lives exactly as long as its connection, so the
    /// pool is pinned to a single connection that is never reaped.
    pub async fn in_memory() -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply every embedded migration not yet recorded in `_catalog_migrations`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _catalog_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT,
                installed_at TEXT DEFAULT CURRENT_TIMESTAMP
             )",
        )
        .execute(&self.pool)
        .await?;

        let applied_rows = sqlx::query("SELECT version FROM _catalog_migrations")
            .fetch_all(&self.pool)
            .await?;
        let mut applied: HashSet<i64> = HashSet::new();
        for r in applied_rows {
            applied.insert(r.try_get::<i64, _>(0)?);
        }

        for &(version, desc, sql) in MIGRATIONS {
            if applied.contains(&version) {
                continue;
            }
            info!(version, desc, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version}_{desc} failed"))?;
            sqlx::query("INSERT INTO _catalog_migrations (version, description) VALUES (?, ?)")
                .bind(version)
                .bind(desc)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            applied.insert(version);
        }

        if let Some(last) = MIGRATIONS.last() {
            info!(version = last.0, desc = last.1, "migrations up-to-date");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_repeatable() {
        let db = Db::in_memory().await.expect("in-memory db");
        db.migrate().await.expect("second migrate should be a no-op");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _catalog_migrations")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn schema_rejects_second_running_run() {
        let db = Db::in_memory().await.unwrap();
        let insert = "INSERT INTO sync_runs (triggered_by, status, started_at, heartbeat_at)
                      VALUES ('test', 'running', '2024-01-01T00:00:00+00:00', '2024-01-01T00:00:00+00:00')";
        sqlx::query(insert).execute(&db.pool).await.unwrap();
        let err = sqlx::query(insert).execute(&db.pool).await;
        assert!(err.is_err(), "partial unique index should reject a second running row");
    }
}
