use catalog_sync::database_ops::catalog::scripted::synthetic_page;
use catalog_sync::database_ops::catalog::{CatalogError, ScriptedCatalogClient};
use catalog_sync::database_ops::db::Db;
use catalog_sync::database_ops::products::ProductUpsertStore;
use catalog_sync::database_ops::sync_runs::{RunStatus, SyncRunStore};
use catalog_sync::orchestrator::{SyncConfig, SyncError, SyncOrchestrator};
use catalog_sync::snapshot::build_quote_snapshot;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> SyncConfig {
    SyncConfig {
        max_backoff: Duration::from_millis(10),
        page_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    }
}

#[tokio::test]
async fn three_full_pages_complete_cleanly() {
    let db = Db::in_memory().await.unwrap();
    let client = Arc::new(ScriptedCatalogClient::from_responses([
        Ok(synthetic_page("E2E", 0, 10, Some("c1"), true)),
        Ok(synthetic_page("E2E", 10, 10, Some("c2"), true)),
        Ok(synthetic_page("E2E", 20, 10, Some("c3"), false)),
    ]));
    let orch = SyncOrchestrator::new(client.clone(), db.clone(), test_config());

    let summary = orch.run_incremental_sync("integration").await.unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(
        (summary.processed, summary.created, summary.updated, summary.failed),
        (30, 30, 0, 0)
    );
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.api_cursor.as_deref(), Some("c3"));
    assert_eq!(
        client.requested_cursors(),
        vec![None, Some("c1".to_string()), Some("c2".to_string())]
    );

    let products = ProductUpsertStore::new(db.clone());
    assert_eq!(products.count().await.unwrap(), 30);
    assert_eq!(products.count_discontinued().await.unwrap(), 0);
    assert_eq!(
        SyncRunStore::new(db).sku_logs(summary.run_id).await.unwrap().len(),
        30
    );
}

#[tokio::test]
async fn failed_run_resumes_from_its_committed_cursor_once_resolved() {
    let db = Db::in_memory().await.unwrap();
    let first_client = Arc::new(ScriptedCatalogClient::from_responses([
        Ok(synthetic_page("R", 0, 10, Some("after-page-1"), true)),
        Err(CatalogError::provider(500, "upstream exploded")),
    ]));
    let first = SyncOrchestrator::new(first_client, db.clone(), test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Failed);
    assert_eq!(first.processed, 10);
    assert_eq!(first.api_cursor.as_deref(), Some("after-page-1"));

    let runs = SyncRunStore::new(db.clone());
    assert!(runs.mark_resolved(first.run_id).await.unwrap());

    let second_client = Arc::new(ScriptedCatalogClient::from_responses([
        Ok(synthetic_page("R", 10, 10, Some("after-page-2"), true)),
        Ok(synthetic_page("R", 20, 10, Some("after-page-3"), false)),
    ]));
    let second = SyncOrchestrator::new(second_client.clone(), db.clone(), test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!((second.processed, second.created), (20, 20));
    assert_eq!(second.start_cursor.as_deref(), Some("after-page-1"));
    assert_eq!(
        second_client.requested_cursors().first().cloned().flatten().as_deref(),
        Some("after-page-1")
    );

    assert_eq!(ProductUpsertStore::new(db).count().await.unwrap(), 30);
}

#[tokio::test]
async fn unresolved_failure_is_not_a_resume_point() {
    let db = Db::in_memory().await.unwrap();
    let failing = Arc::new(ScriptedCatalogClient::from_responses([
        Ok(synthetic_page("U", 0, 5, Some("u1"), true)),
        Err(CatalogError::provider(401, "bad key")),
    ]));
    let failed = SyncOrchestrator::new(failing, db.clone(), test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);

    let retry = Arc::new(ScriptedCatalogClient::from_responses([Ok(synthetic_page(
        "U", 0, 5, Some("u1"), false,
    ))]));
    let replay = SyncOrchestrator::new(retry.clone(), db, test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();
    assert_eq!(retry.requested_cursors(), vec![None]);
    assert_eq!((replay.created, replay.updated), (0, 5));
}

#[tokio::test]
async fn rate_limited_once_then_served() {
    let db = Db::in_memory().await.unwrap();
    let client = Arc::new(ScriptedCatalogClient::from_responses([
        Err(CatalogError::RateLimited { retry_after_ms: 5 }),
        Ok(synthetic_page("RL", 0, 12, None, false)),
    ]));
    let summary = SyncOrchestrator::new(client, db.clone(), test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.rate_limit_hits >= 1);
    assert_eq!(summary.processed, 12);
    assert!(summary.error.is_none());

    let stored = SyncRunStore::new(db).get(summary.run_id).await.unwrap().unwrap();
    assert_eq!(stored.counters.rate_limit_hits, summary.rate_limit_hits);
}

#[tokio::test]
async fn concurrent_runs_admit_exactly_one() {
    let db = Db::in_memory().await.unwrap();
    let slow = || {
        Arc::new(
            ScriptedCatalogClient::from_responses([Ok(synthetic_page("X", 0, 3, None, false))])
                .with_delay(Duration::from_millis(100)),
        )
    };
    let a = SyncOrchestrator::new(slow(), db.clone(), test_config());
    let b = SyncOrchestrator::new(slow(), db.clone(), test_config());

    let (ra, rb) = tokio::join!(a.run_incremental_sync("a"), b.run_incremental_sync("b"));
    let (ok, rejected) = match (ra, rb) {
        (Ok(s), Err(e)) | (Err(e), Ok(s)) => (s, e),
        other => panic!("expected exactly one admitted run, got {other:?}"),
    };
    assert_eq!(ok.status, RunStatus::Completed);
    assert!(matches!(rejected, SyncError::AlreadyRunning { run_id } if run_id == ok.run_id));
    assert_eq!(SyncRunStore::new(db).list_recent(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn snapshot_of_synced_product_survives_repricing() {
    let db = Db::in_memory().await.unwrap();
    let first = Arc::new(ScriptedCatalogClient::from_responses([Ok(synthetic_page(
        "Q", 0, 1, Some("q1"), false,
    ))]));
    SyncOrchestrator::new(first, db.clone(), test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();

    let products = ProductUpsertStore::new(db.clone());
    let product = products.get_by_sku("Q-0000").await.unwrap().unwrap();
    let snapshot = build_quote_snapshot(&product);
    assert_eq!(snapshot.msrp_minor(), 10_099);

    let mut repriced = synthetic_page("Q", 0, 1, Some("q2"), false);
    repriced.records[0].0["msrp"] = serde_json::json!("149.00");
    repriced.records[0].0["discontinued"] = serde_json::json!(true);
    let second = Arc::new(ScriptedCatalogClient::from_responses([Ok(repriced)]));
    let summary = SyncOrchestrator::new(second, db, test_config())
        .run_incremental_sync("cron")
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);

    let now = products.get_by_sku("Q-0000").await.unwrap().unwrap();
    assert_eq!(now.msrp_minor, 14_900);
    assert!(now.is_discontinued);
    assert!(now.discontinued_at.is_some());
    assert_eq!(snapshot.msrp_minor(), 10_099);
    assert!(!snapshot.was_discontinued());
}
