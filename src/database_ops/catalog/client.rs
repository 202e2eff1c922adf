use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One vendor product record exactly as the provider returned it.
///
/// The payload stays opaque until `mapping::map_record` turns it into a
/// [`super::mapping::ProductRecord`]; nothing past the ingestion boundary reads raw keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Value);

impl RawRecord {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// First present, non-null value among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|k| self.0.get(*k))
            .find(|v| !v.is_null())
    }

    /// Best-effort SKU for diagnostics, before validation.
    pub fn sku_hint(&self) -> Option<String> {
        self.first_of(super::mapping::SKU_KEYS)
            .and_then(value_as_string)
    }

    /// Best-effort external id for diagnostics, before validation.
    pub fn external_id_hint(&self) -> Option<String> {
        self.first_of(super::mapping::EXTERNAL_ID_KEYS)
            .and_then(value_as_string)
    }
}

pub(crate) fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One page of the provider's listing plus its rate-limit telemetry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogPage {
    pub records: Vec<RawRecord>,
    /// Continuation cursor for the following page; `None` at the end of the listing.
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub rate_limit_remaining: i64,
    pub rate_limit_reset_ms: i64,
}

/// Failure taxonomy for the upstream boundary. Only `RateLimited` is retryable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("provider rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider error (status={status}): {}", .body.as_deref().unwrap_or("<no body>"))]
    Provider { status: u16, body: Option<String> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("page fetch timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("malformed provider payload: {0}")]
    Decode(String),
}

impl CatalogError {
    /// Provider-suggested wait before retrying the same cursor; `None` for every
    /// non-retryable error.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            CatalogError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    pub fn provider(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        CatalogError::Provider {
            status,
            body: (!body.is_empty()).then_some(body),
        }
    }
}

/// Stateless request/response boundary over the provider's paginated listing.
///
/// `cursor = None` starts from the beginning of the catalog.
#[async_trait::async_trait]
pub trait RemoteCatalogClient: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage, CatalogError>;
}
