use anyhow::{anyhow, Result};
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::client::{CatalogError, CatalogPage, RawRecord, RemoteCatalogClient};
use crate::util::env::{env_opt, env_parse};

const RECORD_ARRAY_KEYS: &[&str] = &["data", "products", "items", "records"];
const NEXT_CURSOR_KEYS: &[&str] = &["next_cursor", "nextCursor", "next"];
const HAS_MORE_KEYS: &[&str] = &["has_more", "hasMore"];
/// Used when a 429 carries neither Retry-After nor a reset hint.
const FALLBACK_RETRY_AFTER_MS: u64 = 1_000;

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

#[derive(Debug, Clone)]
pub struct HttpCatalogConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl HttpCatalogConfig {
    pub fn from_env() -> Result<Self> {
        let base_url = env_opt("CATALOG_API_BASE_URL")
            .ok_or_else(|| anyhow!("missing env var CATALOG_API_BASE_URL"))?;
        Ok(Self {
            base_url,
            api_key: env_opt("CATALOG_API_KEY"),
            page_size: env_parse("CATALOG_PAGE_SIZE", 100u32),
            timeout_secs: env_parse("CATALOG_HTTP_TIMEOUT_SECS", 30u64),
        })
    }
}

/// reqwest-backed client for the provider's `GET {base}/products?cursor=&limit=` listing.
#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
    timeout_ms: u64,
    http: Client,
}

impl HttpCatalogClient {
    pub fn new(cfg: HttpCatalogConfig) -> Result<Self> {
        let timeout_secs = cfg.timeout_secs.max(1);
        let http = Client::builder()
            .user_agent(concat!("catalog-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.filter(|k| !k.trim().is_empty()),
            page_size: cfg.page_size.clamp(1, 1_000),
            timeout_ms: timeout_secs * 1_000,
            http,
        })
    }

    fn products_url(&self) -> String {
        format!("{}/products", self.base_url)
    }
}

#[async_trait::async_trait]
impl RemoteCatalogClient for HttpCatalogClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<CatalogPage, CatalogError> {
        let url = self.products_url();
        let mut req = self
            .http
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .query(&[("limit", self.page_size.to_string())]);
        if let Some(c) = cursor {
            req = req.query(&[("cursor", c)]);
        }
        if let Some(key) = self.api_key.as_deref() {
            req = req.header("X-Api-Key", key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                CatalogError::Timeout {
                    after_ms: self.timeout_ms,
                }
            } else {
                CatalogError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let (remaining, reset_ms) = rate_limit_telemetry(resp.headers());
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = retry_after_ms(resp.headers())
                .or_else(|| (reset_ms > 0).then_some(reset_ms as u64))
                .unwrap_or(FALLBACK_RETRY_AFTER_MS);
            warn!(url=%url, retry_after_ms, "catalog provider throttled (429)");
            return Err(CatalogError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let body = truncate_for_log(resp.text().await.unwrap_or_default(), 2000);
            return Err(CatalogError::provider(status.as_u16(), body));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CatalogError::Decode(e.to_string()))?;
        let page = parse_page_body(&body, remaining, reset_ms)?;
        debug!(
            records = page.records.len(),
            has_more = page.has_more,
            rate_limit_remaining = page.rate_limit_remaining,
            "catalog page fetched"
        );
        Ok(page)
    }
}

/// `Retry-After` as delta-seconds, in milliseconds.
fn retry_after_ms(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1_000))
}

/// (`X-RateLimit-Remaining`, `X-RateLimit-Reset` seconds → ms); -1/0 when absent.
fn rate_limit_telemetry(headers: &header::HeaderMap) -> (i64, i64) {
    let num = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
    };
    let remaining = num("x-ratelimit-remaining").unwrap_or(-1);
    let reset_ms = num("x-ratelimit-reset")
        .map(|secs| secs.saturating_mul(1_000))
        .unwrap_or(0);
    (remaining, reset_ms)
}

fn first_key<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// Decode a listing response body. Pagination fields may sit at the top level or
/// under a `pagination`/`meta` object.
pub fn parse_page_body(
    body: &Value,
    rate_limit_remaining: i64,
    rate_limit_reset_ms: i64,
) -> Result<CatalogPage, CatalogError> {
    let records = first_key(body, RECORD_ARRAY_KEYS)
        .and_then(Value::as_array)
        .ok_or_else(|| CatalogError::Decode("response has no record array".into()))?
        .iter()
        .cloned()
        .map(RawRecord::new)
        .collect::<Vec<_>>();

    let paging = first_key(body, &["pagination", "meta"]).unwrap_or(body);
    let next_cursor = first_key(paging, NEXT_CURSOR_KEYS)
        .or_else(|| first_key(body, NEXT_CURSOR_KEYS))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    let has_more = first_key(paging, HAS_MORE_KEYS)
        .or_else(|| first_key(body, HAS_MORE_KEYS))
        .and_then(Value::as_bool)
        .unwrap_or(next_cursor.is_some());

    Ok(CatalogPage {
        records,
        next_cursor,
        has_more,
        rate_limit_remaining,
        rate_limit_reset_ms,
    })
}
