use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Connection, Row, SqliteConnection};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

use crate::database_ops::catalog::mapping::{
    map_record, Dimensions, ProductRecord, RecordMappingError, VariantLink, Warranty,
};
use crate::database_ops::catalog::RawRecord;
use crate::database_ops::db::Db;

/// Locally authoritative product row, one per upstream SKU.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalProduct {
    pub id: i64,
    pub external_id: String,
    pub sku: String,
    pub brand: String,
    pub model: String,
    pub category_slug: Option<String>,
    pub msrp_minor: i64,
    pub currency: String,
    pub weight_grams: Option<i64>,
    pub dimensions: Dimensions,
    pub specs: BTreeMap<String, Value>,
    pub images: Vec<String>,
    pub warranty: Warranty,
    pub variant: VariantLink,
    pub buyback_value_minor: Option<i64>,
    pub is_discontinued: bool,
    pub discontinued_at: Option<DateTime<Utc>>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalProduct {
    fn from_row(r: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: r.try_get("id")?,
            external_id: r.try_get("external_id")?,
            sku: r.try_get("sku")?,
            brand: r.try_get("brand")?,
            model: r.try_get("model")?,
            category_slug: r.try_get("category_slug")?,
            msrp_minor: r.try_get("msrp_minor")?,
            currency: r.try_get("currency")?,
            weight_grams: r.try_get("weight_grams")?,
            dimensions: Dimensions {
                length_mm: r.try_get("length_mm")?,
                width_mm: r.try_get("width_mm")?,
                height_mm: r.try_get("height_mm")?,
            },
            specs: r.try_get::<Json<BTreeMap<String, Value>>, _>("specs")?.0,
            images: r.try_get::<Json<Vec<String>>, _>("images")?.0,
            warranty: Warranty {
                months: r.try_get("warranty_months")?,
                terms: r.try_get("warranty_terms")?,
            },
            variant: VariantLink {
                group_id: r.try_get("variant_group_id")?,
                variant_type: r.try_get("variant_type")?,
                value: r.try_get("variant_value")?,
            },
            buyback_value_minor: r.try_get("buyback_value_minor")?,
            is_discontinued: r.try_get("is_discontinued")?,
            discontinued_at: r.try_get("discontinued_at")?,
            last_synced_at: r.try_get("last_synced_at")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkuOutcomeKind {
    Created,
    Updated,
    Failed,
}

impl SkuOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkuOutcomeKind::Created => "created",
            SkuOutcomeKind::Updated => "updated",
            SkuOutcomeKind::Failed => "failed",
        }
    }
}

/// Per-record result of a page reconciliation, kept for the SKU audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkuOutcome {
    pub sku: Option<String>,
    pub external_id: Option<String>,
    pub outcome: SkuOutcomeKind,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageReconciliation {
    pub created: i64,
    pub updated: i64,
    pub failed: i64,
    pub outcomes: Vec<SkuOutcome>,
}

impl PageReconciliation {
    fn record(&mut self, outcome: SkuOutcome) {
        match outcome.outcome {
            SkuOutcomeKind::Created => self.created += 1,
            SkuOutcomeKind::Updated => self.updated += 1,
            SkuOutcomeKind::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// `discontinued_at` after applying an incoming flag to an existing row.
///
/// Set on false→true, cleared on true→false, untouched otherwise.
pub fn resolve_discontinued_at(
    existing: Option<(bool, Option<DateTime<Utc>>)>,
    incoming: bool,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match (existing, incoming) {
        (_, false) => None,
        (None, true) | (Some((false, _)), true) => Some(now),
        // A flagged row missing its timestamp gets one so the pair stays consistent.
        (Some((true, at)), true) => at.or(Some(now)),
    }
}

/// Idempotent reconciliation of raw provider pages into `catalog_products`.
#[derive(Clone)]
pub struct ProductUpsertStore {
    db: Db,
}

impl ProductUpsertStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Reconcile one page atomically. Mapping failures and per-record write failures
    /// are counted in `failed` and do not abort the page; an `Err` means the page as a
    /// whole was not committed.
    #[instrument(skip(self, records), fields(records = records.len()))]
    pub async fn reconcile_page(&self, records: &[RawRecord]) -> Result<PageReconciliation> {
        // Records are independent, so mapping fans out; the writes below stay serial.
        let mapped: Vec<Result<ProductRecord, RecordMappingError>> =
            records.par_iter().map(map_record).collect();

        let now = Utc::now();
        let mut result = PageReconciliation::default();
        let mut tx = self.db.pool.begin().await.context("begin page transaction")?;

        for (raw, mapped) in records.iter().zip(mapped) {
            let rec = match mapped {
                Ok(rec) => rec,
                Err(e) => {
                    warn!(sku = ?raw.sku_hint(), error = %e, "catalog record failed mapping");
                    result.record(SkuOutcome {
                        sku: raw.sku_hint(),
                        external_id: raw.external_id_hint(),
                        outcome: SkuOutcomeKind::Failed,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            let mut savepoint = tx.begin().await?;
            match upsert_one(&mut savepoint, &rec, now).await {
                Ok(kind) => {
                    savepoint.commit().await?;
                    result.record(SkuOutcome {
                        sku: Some(rec.sku),
                        external_id: Some(rec.external_id),
                        outcome: kind,
                        error: None,
                    });
                }
                Err(e) => {
                    savepoint.rollback().await?;
                    warn!(sku = %rec.sku, error = %e, "catalog record failed to persist");
                    result.record(SkuOutcome {
                        sku: Some(rec.sku),
                        external_id: Some(rec.external_id),
                        outcome: SkuOutcomeKind::Failed,
                        error: Some(format!("{e:#}")),
                    });
                }
            }
        }

        tx.commit().await.context("commit page transaction")?;
        debug!(
            created = result.created,
            updated = result.updated,
            failed = result.failed,
            "page reconciled"
        );
        Ok(result)
    }

    pub async fn get_by_sku(&self, sku: &str) -> Result<Option<CanonicalProduct>> {
        let row = sqlx::query("SELECT * FROM catalog_products WHERE sku = ?")
            .bind(sku)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(CanonicalProduct::from_row).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM catalog_products")
            .fetch_one(&self.db.pool)
            .await?)
    }

    pub async fn count_discontinued(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM catalog_products WHERE is_discontinued = 1")
                .fetch_one(&self.db.pool)
                .await?,
        )
    }

    /// Products ordered by SKU, for read-only consumers.
    pub async fn list_page(&self, offset: i64, limit: i64) -> Result<Vec<CanonicalProduct>> {
        let rows = sqlx::query("SELECT * FROM catalog_products ORDER BY sku LIMIT ? OFFSET ?")
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(&self.db.pool)
            .await?;
        rows.iter().map(CanonicalProduct::from_row).collect()
    }
}

async fn upsert_one(
    conn: &mut SqliteConnection,
    rec: &ProductRecord,
    now: DateTime<Utc>,
) -> Result<SkuOutcomeKind> {
    let existing: Option<(bool, Option<DateTime<Utc>>)> = sqlx::query_as(
        "SELECT is_discontinued, discontinued_at FROM catalog_products WHERE sku = ?",
    )
    .bind(&rec.sku)
    .fetch_optional(&mut *conn)
    .await?;
    let discontinued_at = resolve_discontinued_at(existing, rec.discontinued, now);

    if existing.is_none() {
        sqlx::query(
            r#"INSERT INTO catalog_products (
                external_id, sku, brand, model, category_slug, msrp_minor, currency,
                weight_grams, length_mm, width_mm, height_mm, specs, images,
                warranty_months, warranty_terms, variant_group_id, variant_type, variant_value,
                buyback_value_minor, is_discontinued, discontinued_at,
                last_synced_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&rec.external_id)
        .bind(&rec.sku)
        .bind(&rec.brand)
        .bind(&rec.model)
        .bind(&rec.category_slug)
        .bind(rec.msrp_minor)
        .bind(&rec.currency)
        .bind(rec.weight_grams)
        .bind(rec.dimensions.length_mm)
        .bind(rec.dimensions.width_mm)
        .bind(rec.dimensions.height_mm)
        .bind(Json(&rec.specs))
        .bind(Json(&rec.images))
        .bind(rec.warranty.months)
        .bind(&rec.warranty.terms)
        .bind(&rec.variant.group_id)
        .bind(&rec.variant.variant_type)
        .bind(&rec.variant.value)
        .bind(rec.buyback_value_minor)
        .bind(rec.discontinued)
        .bind(discontinued_at)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        return Ok(SkuOutcomeKind::Created);
    }

    // Every mapped column is overwritten and updated_at bumped even when nothing changed.
    sqlx::query(
        r#"UPDATE catalog_products SET
            external_id = ?, brand = ?, model = ?, category_slug = ?, msrp_minor = ?,
            currency = ?, weight_grams = ?, length_mm = ?, width_mm = ?, height_mm = ?,
            specs = ?, images = ?, warranty_months = ?, warranty_terms = ?,
            variant_group_id = ?, variant_type = ?, variant_value = ?,
            buyback_value_minor = ?, is_discontinued = ?, discontinued_at = ?,
            last_synced_at = ?, updated_at = ?
        WHERE sku = ?"#,
    )
    .bind(&rec.external_id)
    .bind(&rec.brand)
    .bind(&rec.model)
    .bind(&rec.category_slug)
    .bind(rec.msrp_minor)
    .bind(&rec.currency)
    .bind(rec.weight_grams)
    .bind(rec.dimensions.length_mm)
    .bind(rec.dimensions.width_mm)
    .bind(rec.dimensions.height_mm)
    .bind(Json(&rec.specs))
    .bind(Json(&rec.images))
    .bind(rec.warranty.months)
    .bind(&rec.warranty.terms)
    .bind(&rec.variant.group_id)
    .bind(&rec.variant.variant_type)
    .bind(&rec.variant.value)
    .bind(rec.buyback_value_minor)
    .bind(rec.discontinued)
    .bind(discontinued_at)
    .bind(now)
    .bind(now)
    .bind(&rec.sku)
    .execute(&mut *conn)
    .await?;
    Ok(SkuOutcomeKind::Updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::catalog::scripted::synthetic_page;
    use chrono::Duration;
    use serde_json::json;

    fn record(sku: &str, price: &str, discontinued: bool) -> RawRecord {
        RawRecord::new(json!({
            "sku": sku,
            "brand": "Acme",
            "model": format!("Model {sku}"),
            "msrp": price,
            "discontinued": discontinued,
            "specs": {"panel": "oled", "hz": 120}
        }))
    }

    /// Row content with freshness timestamps blanked.
    fn content(mut p: CanonicalProduct) -> CanonicalProduct {
        p.updated_at = DateTime::<Utc>::MIN_UTC;
        p.last_synced_at = DateTime::<Utc>::MIN_UTC;
        p
    }

    async fn store() -> ProductUpsertStore {
        ProductUpsertStore::new(Db::in_memory().await.expect("in-memory db"))
    }

    #[test]
    fn discontinued_at_transitions() {
        let now = Utc::now();
        let earlier = now - Duration::days(3);
        assert_eq!(resolve_discontinued_at(None, false, now), None);
        assert_eq!(resolve_discontinued_at(None, true, now), Some(now));
        assert_eq!(resolve_discontinued_at(Some((false, None)), true, now), Some(now));
        assert_eq!(
            resolve_discontinued_at(Some((true, Some(earlier))), true, now),
            Some(earlier)
        );
        assert_eq!(resolve_discontinued_at(Some((true, Some(earlier))), false, now), None);
        assert_eq!(resolve_discontinued_at(Some((false, None)), false, now), None);
    }

    #[tokio::test]
    async fn replaying_a_page_is_idempotent() {
        let store = store().await;
        let page = synthetic_page("TV", 0, 10, Some("c1"), true);

        let first = store.reconcile_page(&page.records).await.unwrap();
        assert_eq!((first.created, first.updated, first.failed), (10, 0, 0));
        let before: Vec<_> = store
            .list_page(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(content)
            .collect();

        let second = store.reconcile_page(&page.records).await.unwrap();
        assert_eq!((second.created, second.updated, second.failed), (0, 10, 0));
        let after: Vec<_> = store
            .list_page(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(content)
            .collect();

        assert_eq!(store.count().await.unwrap(), 10);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn update_bumps_freshness_and_overwrites_fields() {
        let store = store().await;
        store
            .reconcile_page(&[record("A-1", "10.00", false)])
            .await
            .unwrap();
        let v1 = store.get_by_sku("A-1").await.unwrap().unwrap();

        store
            .reconcile_page(&[record("A-1", "12.50", false)])
            .await
            .unwrap();
        let v2 = store.get_by_sku("A-1").await.unwrap().unwrap();

        assert_eq!(v2.id, v1.id);
        assert_eq!(v2.msrp_minor, 1_250);
        assert_eq!(v2.created_at, v1.created_at);
        assert!(v2.updated_at >= v1.updated_at);
        assert_eq!(v2.specs.get("hz"), Some(&json!(120)));
    }

    #[tokio::test]
    async fn discontinued_at_is_set_once_and_cleared_on_revival() {
        let store = store().await;
        store.reconcile_page(&[record("D-1", "5", false)]).await.unwrap();
        let live = store.get_by_sku("D-1").await.unwrap().unwrap();
        assert!(!live.is_discontinued);
        assert!(live.discontinued_at.is_none());

        store.reconcile_page(&[record("D-1", "5", true)]).await.unwrap();
        let gone = store.get_by_sku("D-1").await.unwrap().unwrap();
        assert!(gone.is_discontinued);
        let stamped = gone.discontinued_at.expect("timestamp on false→true");

        store.reconcile_page(&[record("D-1", "5", true)]).await.unwrap();
        let still_gone = store.get_by_sku("D-1").await.unwrap().unwrap();
        assert_eq!(still_gone.discontinued_at, Some(stamped));
        assert_eq!(store.count_discontinued().await.unwrap(), 1);

        store.reconcile_page(&[record("D-1", "5", false)]).await.unwrap();
        let revived = store.get_by_sku("D-1").await.unwrap().unwrap();
        assert!(!revived.is_discontinued);
        assert!(revived.discontinued_at.is_none());
    }

    #[tokio::test]
    async fn bad_records_are_counted_without_aborting_the_page() {
        let store = store().await;
        let page = vec![
            record("OK-1", "1.00", false),
            RawRecord::new(json!({"brand": "NoSku", "model": "x", "msrp": 1})),
            RawRecord::new(json!({"sku": "BAD-PRICE", "brand": "b", "model": "m", "msrp": "n/a"})),
            record("OK-2", "2.00", false),
        ];
        let res = store.reconcile_page(&page).await.unwrap();
        assert_eq!((res.created, res.updated, res.failed), (2, 0, 2));
        assert_eq!(store.count().await.unwrap(), 2);

        let failed: Vec<_> = res
            .outcomes
            .iter()
            .filter(|o| o.outcome == SkuOutcomeKind::Failed)
            .collect();
        assert_eq!(failed[0].sku, None);
        assert!(failed[0].error.as_deref().unwrap().contains("sku"));
        assert_eq!(failed[1].sku.as_deref(), Some("BAD-PRICE"));
    }

    #[tokio::test]
    async fn write_failure_rolls_back_only_that_record() {
        let store = store().await;
        sqlx::raw_sql(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON catalog_products
             WHEN NEW.sku = 'POISON'
             BEGIN SELECT RAISE(ABORT, 'poisoned sku'); END;",
        )
        .execute(&store.db.pool)
        .await
        .unwrap();

        let page = vec![
            record("OK-1", "1.00", false),
            record("POISON", "1.00", false),
            record("OK-2", "1.00", false),
        ];
        let res = store.reconcile_page(&page).await.unwrap();
        assert_eq!((res.created, res.failed), (2, 1));
        assert!(store.get_by_sku("POISON").await.unwrap().is_none());
        assert!(res.outcomes[1]
            .error
            .as_deref()
            .unwrap()
            .contains("poisoned sku"));
    }

    #[tokio::test]
    async fn duplicate_sku_within_a_page_yields_one_row() {
        let store = store().await;
        let page = vec![record("DUP", "1.00", false), record("DUP", "2.00", false)];
        let res = store.reconcile_page(&page).await.unwrap();
        assert_eq!((res.created, res.updated), (1, 1));
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(
            store.get_by_sku("DUP").await.unwrap().unwrap().msrp_minor,
            200
        );
    }
}
