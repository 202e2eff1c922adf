//! Vendor record → canonical product mapping.
//!
//! Upstream feeds spell the same concept several ways (`sku`/`SKU`, `msrp`/`price`, ...).
//! Every alias is resolved here, once, so the rest of the pipeline only ever sees the
//! canonical field names on [`ProductRecord`].
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::client::{value_as_string, RawRecord};

pub(crate) const SKU_KEYS: &[&str] = &["sku", "SKU", "sku_code"];
pub(crate) const EXTERNAL_ID_KEYS: &[&str] = &["external_id", "id", "productId", "product_id"];
const BRAND_KEYS: &[&str] = &["brand", "manufacturer", "brand_name"];
const MODEL_KEYS: &[&str] = &["model", "name", "title"];
const CATEGORY_KEYS: &[&str] = &["category_slug", "category", "categorySlug"];
const PRICE_KEYS: &[&str] = &["msrp", "price", "list_price", "listPrice"];
const CURRENCY_KEYS: &[&str] = &["currency", "currency_code", "currencyCode"];
const WEIGHT_G_KEYS: &[&str] = &["weight_grams", "weight_g", "weightGrams"];
const WEIGHT_KG_KEYS: &[&str] = &["weight_kg", "weightKg"];
const DIMENSIONS_KEYS: &[&str] = &["dimensions", "dimensions_mm"];
const SPECS_KEYS: &[&str] = &["specs", "specifications", "attributes"];
const IMAGES_KEYS: &[&str] = &["images", "image_urls", "imageUrls"];
const IMAGE_SINGLE_KEYS: &[&str] = &["image", "image_url", "imageUrl"];
const WARRANTY_KEYS: &[&str] = &["warranty"];
const WARRANTY_MONTHS_KEYS: &[&str] = &["warranty_months", "warrantyMonths"];
const WARRANTY_TERMS_KEYS: &[&str] = &["warranty_terms", "warrantyTerms"];
const VARIANT_GROUP_KEYS: &[&str] = &["variant_group_id", "variantGroupId", "variant_group"];
const VARIANT_TYPE_KEYS: &[&str] = &["variant_type", "variantType"];
const VARIANT_VALUE_KEYS: &[&str] = &["variant_value", "variantValue"];
const BUYBACK_KEYS: &[&str] = &["buyback_value", "buybackValue", "trade_in_value"];
const DISCONTINUED_KEYS: &[&str] = &["discontinued", "is_discontinued", "isDiscontinued"];

pub const DEFAULT_CURRENCY: &str = "USD";

/// Per-record validation failure. Counted against the page, never fatal to it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordMappingError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> RecordMappingError {
    RecordMappingError::InvalidField {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length_mm: Option<i64>,
    pub width_mm: Option<i64>,
    pub height_mm: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warranty {
    pub months: Option<i64>,
    pub terms: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantLink {
    pub group_id: Option<String>,
    pub variant_type: Option<String>,
    pub value: Option<String>,
}

/// A validated vendor record with canonical field names, ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
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
    pub discontinued: bool,
}

/// Map one raw vendor record into a [`ProductRecord`].
pub fn map_record(raw: &RawRecord) -> Result<ProductRecord, RecordMappingError> {
    if !raw.0.is_object() {
        return Err(RecordMappingError::NotAnObject);
    }

    let sku = required_string(raw, SKU_KEYS, "sku")?;
    // Feeds without a separate upstream id are keyed by SKU.
    let external_id = optional_string(raw, EXTERNAL_ID_KEYS).unwrap_or_else(|| sku.clone());
    let brand = required_string(raw, BRAND_KEYS, "brand")?;
    let model = required_string(raw, MODEL_KEYS, "model")?;
    let category_slug = optional_string(raw, CATEGORY_KEYS)
        .map(|c| slugify(&c))
        .filter(|s| !s.is_empty());

    let currency = match optional_string(raw, CURRENCY_KEYS) {
        Some(c) => normalize_currency(&c)?,
        None => DEFAULT_CURRENCY.to_string(),
    };
    let minor_unit = currency_minor_unit(&currency);

    let msrp_minor = match raw.first_of(PRICE_KEYS) {
        Some(v) => money_value_to_minor(v, minor_unit).map_err(|r| invalid("msrp", r))?,
        None => return Err(RecordMappingError::MissingField("msrp")),
    };
    let buyback_value_minor = raw
        .first_of(BUYBACK_KEYS)
        .map(|v| money_value_to_minor(v, minor_unit).map_err(|r| invalid("buyback_value", r)))
        .transpose()?;

    let weight_grams = match raw.first_of(WEIGHT_G_KEYS) {
        Some(v) => Some(non_negative_int(v, "weight_grams")?),
        None => raw
            .first_of(WEIGHT_KG_KEYS)
            .map(kilograms_to_grams)
            .transpose()?,
    };

    Ok(ProductRecord {
        external_id,
        sku,
        brand,
        model,
        category_slug,
        msrp_minor,
        currency,
        weight_grams,
        dimensions: map_dimensions(raw)?,
        specs: map_specs(raw)?,
        images: map_images(raw),
        warranty: map_warranty(raw)?,
        variant: VariantLink {
            group_id: optional_string(raw, VARIANT_GROUP_KEYS),
            variant_type: optional_string(raw, VARIANT_TYPE_KEYS),
            value: optional_string(raw, VARIANT_VALUE_KEYS),
        },
        buyback_value_minor,
        discontinued: map_discontinued(raw)?,
    })
}

fn required_string(
    raw: &RawRecord,
    keys: &[&str],
    field: &'static str,
) -> Result<String, RecordMappingError> {
    match raw.first_of(keys) {
        None => Err(RecordMappingError::MissingField(field)),
        Some(v) => value_as_string(v).ok_or_else(|| invalid(field, "expected non-empty string")),
    }
}

fn optional_string(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    raw.first_of(keys).and_then(value_as_string)
}

pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn normalize_currency(code: &str) -> Result<String, RecordMappingError> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(invalid("currency", format!("`{code}` is not an ISO 4217 code")))
    }
}

/// Number of minor-unit digits for a currency.
pub fn currency_minor_unit(code: &str) -> u32 {
    match code.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "HUF" => 0,
        "BHD" | "IQD" | "KWD" | "JOD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

fn money_value_to_minor(v: &Value, minor_unit: u32) -> Result<i64, String> {
    match v {
        Value::Number(n) => parse_money_minor(&n.to_string(), minor_unit),
        Value::String(s) => parse_money_minor(s, minor_unit),
        Value::Object(o) => match o.get("amount") {
            Some(inner) => money_value_to_minor(inner, minor_unit),
            None => Err("price object without `amount`".into()),
        },
        other => Err(format!("expected number or decimal string, got {other}")),
    }
}

/// Parse a decimal amount ("1,299.99", "19.9", "450") into integer minor units.
/// Extra fractional digits beyond the currency's scale are truncated.
pub fn parse_money_minor(s: &str, minor_unit: u32) -> Result<i64, String> {
    let mut normalized: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if normalized.starts_with('-') {
        return Err(format!("negative amount `{s}`"));
    }
    normalized = normalized.trim_start_matches(['$', '€', '£', '¥']).to_string();
    if normalized.contains(',') {
        let (int_part, rest) = match normalized.split_once('.') {
            Some((i, f)) => (i.to_string(), Some(f.to_string())),
            None => (normalized.clone(), None),
        };
        normalized = if is_thousands_grouped(&int_part) {
            let grouped: String = int_part.chars().filter(|&c| c != ',').collect();
            match rest {
                Some(frac) => format!("{grouped}.{frac}"),
                None => grouped,
            }
        } else {
            // "19,9" / "19,99": a lone comma before one or two digits is a decimal comma.
            match (rest, int_part.split_once(',')) {
                (None, Some((whole, frac)))
                    if !frac.contains(',') && (1..=2).contains(&frac.len()) =>
                {
                    format!("{whole}.{frac}")
                }
                _ => return Err(format!("ambiguous digit grouping in `{s}`")),
            }
        };
    }

    let mut parts = normalized.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
    {
        return Err(format!("unparseable amount `{s}`"));
    }

    let mut frac: String = frac_part.chars().take(minor_unit as usize).collect();
    while frac.len() < minor_unit as usize {
        frac.push('0');
    }
    let digits = format!("{}{}", if int_part.is_empty() { "0" } else { int_part }, frac);
    digits
        .parse::<i64>()
        .map_err(|_| format!("amount `{s}` out of range"))
}

/// `1,299` / `12,800,000`: one to three leading digits, then comma-separated triples.
fn is_thousands_grouped(int_part: &str) -> bool {
    let mut groups = int_part.split(',');
    let lead_ok = groups
        .next()
        .is_some_and(|g| (1..=3).contains(&g.len()) && g.chars().all(|c| c.is_ascii_digit()));
    let mut rest = groups.peekable();
    lead_ok
        && rest.peek().is_some()
        && rest.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

fn non_negative_int(v: &Value, field: &'static str) -> Result<i64, RecordMappingError> {
    let parsed = match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
        _ => None,
    };
    match parsed {
        Some(n) if n >= 0 => Ok(n),
        Some(_) => Err(invalid(field, "must not be negative")),
        None => Err(invalid(field, format!("expected a number, got {v}"))),
    }
}

fn kilograms_to_grams(v: &Value) -> Result<i64, RecordMappingError> {
    let kg = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid("weight_kg", format!("expected a number, got {v}")))?;
    if kg < 0.0 || !kg.is_finite() {
        return Err(invalid("weight_kg", "must be a finite, non-negative number"));
    }
    Ok((kg * 1000.0).round() as i64)
}

fn map_dimensions(raw: &RawRecord) -> Result<Dimensions, RecordMappingError> {
    let nested = raw.first_of(DIMENSIONS_KEYS).and_then(Value::as_object);
    let pick = |obj: Option<&Map<String, Value>>, keys: &[&str], field: &'static str| {
        let found = match obj {
            Some(o) => keys.iter().filter_map(|k| o.get(*k)).find(|v| !v.is_null()),
            None => raw.first_of(keys),
        };
        found.map(|v| non_negative_int(v, field)).transpose()
    };
    Ok(Dimensions {
        length_mm: pick(nested, &["length_mm", "length"], "length_mm")?,
        width_mm: pick(nested, &["width_mm", "width"], "width_mm")?,
        height_mm: pick(nested, &["height_mm", "height"], "height_mm")?,
    })
}

fn map_specs(raw: &RawRecord) -> Result<BTreeMap<String, Value>, RecordMappingError> {
    match raw.first_of(SPECS_KEYS) {
        None => Ok(BTreeMap::new()),
        Some(Value::Object(o)) => Ok(o.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Some(other) => Err(invalid("specs", format!("expected an object, got {other}"))),
    }
}

fn map_images(raw: &RawRecord) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(arr) = raw.first_of(IMAGES_KEYS).and_then(Value::as_array) {
        for item in arr {
            let url = item
                .as_str()
                .or_else(|| item.get("url").and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty());
            if let Some(url) = url {
                if !out.iter().any(|u| u == url) {
                    out.push(url.to_string());
                }
            }
        }
    }
    if out.is_empty() {
        if let Some(single) = optional_string(raw, IMAGE_SINGLE_KEYS) {
            out.push(single);
        }
    }
    out
}

fn map_warranty(raw: &RawRecord) -> Result<Warranty, RecordMappingError> {
    let mut warranty = Warranty {
        months: raw
            .first_of(WARRANTY_MONTHS_KEYS)
            .map(|v| non_negative_int(v, "warranty_months"))
            .transpose()?,
        terms: optional_string(raw, WARRANTY_TERMS_KEYS),
    };
    match raw.first_of(WARRANTY_KEYS) {
        Some(Value::Object(o)) => {
            if warranty.months.is_none() {
                warranty.months = o
                    .get("months")
                    .filter(|v| !v.is_null())
                    .map(|v| non_negative_int(v, "warranty_months"))
                    .transpose()?;
            }
            if warranty.terms.is_none() {
                warranty.terms = o.get("terms").and_then(value_as_string);
            }
        }
        Some(v @ Value::String(_)) if warranty.terms.is_none() => {
            warranty.terms = value_as_string(v);
        }
        _ => {}
    }
    Ok(warranty)
}

fn map_discontinued(raw: &RawRecord) -> Result<bool, RecordMappingError> {
    match raw.first_of(DISCONTINUED_KEYS) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(n.as_i64().unwrap_or(0) != 0),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => Ok(true),
            "0" | "false" | "no" | "n" | "" => Ok(false),
            other => Err(invalid("discontinued", format!("unrecognized flag `{other}`"))),
        },
        Some(other) => Err(invalid("discontinued", format!("unrecognized flag {other}"))),
    }
}
