use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::client::{CatalogError, CatalogPage, RawRecord, RemoteCatalogClient};
use super::http::parse_page_body;

/// Catalog client that replays canned responses in call order.
///
/// Every requested cursor is recorded so callers can assert exactly where a run
/// resumed. Used by the test-suite and by `catalog_sync run --fixture` dry runs.
#[derive(Debug, Default)]
pub struct ScriptedCatalogClient {
    responses: Mutex<VecDeque<Result<CatalogPage, CatalogError>>>,
    requested: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

impl ScriptedCatalogClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responses(responses: impl IntoIterator<Item = Result<CatalogPage, CatalogError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Sleep before answering each call (exercises fetch timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_page(&self, page: CatalogPage) {
        self.push(Ok(page));
    }

    pub fn push_error(&self, err: CatalogError) {
        self.push(Err(err));
    }

    fn push(&self, response: Result<CatalogPage, CatalogError>) {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(response);
    }

    /// Cursors passed to `fetch_page`, in call order.
    pub fn requested_cursors(&self) -> Vec<Option<String>> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Load a JSON fixture: an array whose entries are either listing bodies (same
    /// shape the HTTP client decodes) or `{"rateLimited": ms}` / `{"providerError": status}`.
    pub fn from_fixture_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read fixture {}", path.display()))?;
        let doc: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse fixture {}", path.display()))?;
        Self::from_fixture_value(&doc)
    }

    pub fn from_fixture_value(doc: &Value) -> Result<Self> {
        let entries = doc
            .as_array()
            .ok_or_else(|| anyhow!("fixture must be a JSON array of responses"))?;
        let mut responses = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if let Some(ms) = entry.get("rateLimited").and_then(Value::as_u64) {
                responses.push(Err(CatalogError::RateLimited { retry_after_ms: ms }));
            } else if let Some(status) = entry.get("providerError").and_then(Value::as_u64) {
                let status = u16::try_from(status)
                    .map_err(|_| anyhow!("fixture entry {i}: status {status} out of range"))?;
                responses.push(Err(CatalogError::provider(status, "fixture provider error")));
            } else {
                let page = parse_page_body(entry, -1, 0)
                    .map_err(|e| anyhow!("fixture entry {i}: {e}"))?;
                responses.push(Ok(page));
            }
        }
        Ok(Self::from_responses(responses))
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait::async_trait]
impl RemoteCatalogClient for ScriptedCatalogClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage, CatalogError> {
        self.requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(cursor.map(str::to_string));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Err(CatalogError::provider(599, "scripted client exhausted")))
    }
}

/// Build a page of `count` well-formed records with SKUs `{prefix}-{start}..`.
pub fn synthetic_page(
    prefix: &str,
    start: usize,
    count: usize,
    next_cursor: Option<&str>,
    has_more: bool,
) -> CatalogPage {
    let records = (start..start + count)
        .map(|i| {
            RawRecord::new(serde_json::json!({
                "id": format!("ext-{prefix}-{i}"),
                "sku": format!("{prefix}-{i:04}"),
                "brand": "Acme",
                "model": format!("Model {i}"),
                "category": "appliances",
                "msrp": format!("{}.99", 100 + i),
                "currency": "USD",
                "images": [format!("https://img.example/{prefix}/{i}.jpg")],
                "discontinued": false
            }))
        })
        .collect();
    CatalogPage {
        records,
        next_cursor: next_cursor.map(str::to_string),
        has_more,
        rate_limit_remaining: 100,
        rate_limit_reset_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_and_records_cursors() {
        let client = ScriptedCatalogClient::new();
        client.push_error(CatalogError::RateLimited { retry_after_ms: 1 });
        client.push_page(synthetic_page("A", 0, 2, Some("c1"), false));

        let first = client.fetch_page(None).await;
        assert_eq!(first, Err(CatalogError::RateLimited { retry_after_ms: 1 }));
        let second = client.fetch_page(None).await.expect("page");
        assert_eq!(second.records.len(), 2);
        assert_eq!(second.next_cursor.as_deref(), Some("c1"));

        let exhausted = client.fetch_page(Some("c1")).await;
        assert!(matches!(exhausted, Err(CatalogError::Provider { status: 599, .. })));
        assert_eq!(
            client.requested_cursors(),
            vec![None, None, Some("c1".to_string())]
        );
    }

    #[test]
    fn fixture_entries_become_pages_and_errors() {
        let doc = serde_json::json!([
            {"rateLimited": 250},
            {"products": [{"sku": "F-1"}], "nextCursor": "f1", "hasMore": true},
            {"providerError": 503}
        ]);
        let client = ScriptedCatalogClient::from_fixture_value(&doc).unwrap();
        assert_eq!(client.remaining(), 3);

        let bad = ScriptedCatalogClient::from_fixture_value(&serde_json::json!({"products": []}));
        assert!(bad.is_err());

        let oversized = ScriptedCatalogClient::from_fixture_value(&serde_json::json!([
            {"providerError": 70000}
        ]));
        let err = oversized.unwrap_err().to_string();
        assert!(err.contains("out of range"), "{err}");
    }
}
