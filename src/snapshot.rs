//! Point-in-time pricing snapshots for quote line items.
//!
//! A [`QuoteSnapshot`] is a deep copy of the quote-relevant fields of a
//! [`CanonicalProduct`], taken when the product is added to a quote. Later syncs may
//! reprice or discontinue the product; the snapshot never follows.
//!
//! Fields are private and there are no setters, so a snapshot cannot be altered once
//! built:
//!
//! ```compile_fail
//! use catalog_sync::snapshot::QuoteSnapshot;
//!
//! fn reprice(snapshot: &mut QuoteSnapshot) {
//!     snapshot.msrp_minor = 1;
//! }
//! ```
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::database_ops::products::CanonicalProduct;

/// Version tag of the product → snapshot field mapping. Bump when the field set changes.
pub const SNAPSHOT_SCHEMA_VERSION: &str = "quote-snapshot/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDimensions {
    length_mm: Option<i64>,
    width_mm: Option<i64>,
    height_mm: Option<i64>,
}

impl SnapshotDimensions {
    pub fn length_mm(&self) -> Option<i64> {
        self.length_mm
    }
    pub fn width_mm(&self) -> Option<i64> {
        self.width_mm
    }
    pub fn height_mm(&self) -> Option<i64> {
        self.height_mm
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSnapshot {
    product_id: i64,
    product_external_id: String,
    product_sku: String,
    brand: String,
    model: String,
    category_slug: Option<String>,
    msrp_minor: i64,
    currency: String,
    weight_grams: Option<i64>,
    dimensions: SnapshotDimensions,
    specs: BTreeMap<String, Value>,
    images: Vec<String>,
    warranty_months: Option<i64>,
    warranty_terms: Option<String>,
    variant_group_id: Option<String>,
    variant_type: Option<String>,
    variant_value: Option<String>,
    buyback_value_minor: Option<i64>,
    was_discontinued: bool,
    snapshot_taken_at: String,
    snapshot_schema_version: String,
}

impl QuoteSnapshot {
    pub fn product_id(&self) -> i64 {
        self.product_id
    }
    pub fn product_external_id(&self) -> &str {
        &self.product_external_id
    }
    pub fn product_sku(&self) -> &str {
        &self.product_sku
    }
    pub fn brand(&self) -> &str {
        &self.brand
    }
    pub fn model(&self) -> &str {
        &self.model
    }
    pub fn category_slug(&self) -> Option<&str> {
        self.category_slug.as_deref()
    }
    pub fn msrp_minor(&self) -> i64 {
        self.msrp_minor
    }
    pub fn currency(&self) -> &str {
        &self.currency
    }
    pub fn weight_grams(&self) -> Option<i64> {
        self.weight_grams
    }
    pub fn dimensions(&self) -> &SnapshotDimensions {
        &self.dimensions
    }
    pub fn specs(&self) -> &BTreeMap<String, Value> {
        &self.specs
    }
    pub fn images(&self) -> &[String] {
        &self.images
    }
    pub fn warranty_months(&self) -> Option<i64> {
        self.warranty_months
    }
    pub fn warranty_terms(&self) -> Option<&str> {
        self.warranty_terms.as_deref()
    }
    pub fn variant_group_id(&self) -> Option<&str> {
        self.variant_group_id.as_deref()
    }
    pub fn variant_type(&self) -> Option<&str> {
        self.variant_type.as_deref()
    }
    pub fn variant_value(&self) -> Option<&str> {
        self.variant_value.as_deref()
    }
    pub fn buyback_value_minor(&self) -> Option<i64> {
        self.buyback_value_minor
    }
    /// Whether the product was already discontinued when quoted.
    pub fn was_discontinued(&self) -> bool {
        self.was_discontinued
    }
    /// RFC 3339 timestamp (UTC, microseconds) of when the snapshot was built.
    pub fn snapshot_taken_at(&self) -> &str {
        &self.snapshot_taken_at
    }
    pub fn snapshot_taken_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.snapshot_taken_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
    pub fn snapshot_schema_version(&self) -> &str {
        &self.snapshot_schema_version
    }

    /// Same content, ignoring when each snapshot was taken.
    pub fn same_content_as(&self, other: &QuoteSnapshot) -> bool {
        QuoteSnapshot {
            snapshot_taken_at: String::new(),
            ..self.clone()
        } == QuoteSnapshot {
            snapshot_taken_at: String::new(),
            ..other.clone()
        }
    }
}

/// Build a snapshot stamped with the current time.
pub fn build_quote_snapshot(product: &CanonicalProduct) -> QuoteSnapshot {
    build_quote_snapshot_at(product, Utc::now())
}

/// Build a snapshot with an explicit timestamp. Pure: reads `product`, copies what
/// it needs, touches nothing else.
pub fn build_quote_snapshot_at(product: &CanonicalProduct, taken_at: DateTime<Utc>) -> QuoteSnapshot {
    QuoteSnapshot {
        product_id: product.id,
        product_external_id: product.external_id.clone(),
        product_sku: product.sku.clone(),
        brand: product.brand.clone(),
        model: product.model.clone(),
        category_slug: product.category_slug.clone(),
        msrp_minor: product.msrp_minor,
        currency: product.currency.clone(),
        weight_grams: product.weight_grams,
        dimensions: SnapshotDimensions {
            length_mm: product.dimensions.length_mm,
            width_mm: product.dimensions.width_mm,
            height_mm: product.dimensions.height_mm,
        },
        specs: product.specs.clone(),
        images: product.images.clone(),
        warranty_months: product.warranty.months,
        warranty_terms: product.warranty.terms.clone(),
        variant_group_id: product.variant.group_id.clone(),
        variant_type: product.variant.variant_type.clone(),
        variant_value: product.variant.value.clone(),
        buyback_value_minor: product.buyback_value_minor,
        was_discontinued: product.is_discontinued,
        snapshot_taken_at: taken_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        snapshot_schema_version: SNAPSHOT_SCHEMA_VERSION.to_string(),
    }
}
