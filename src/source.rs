//! # Paged Source Module
//!
//! ## Purpose
//! Abstraction over the remote keyset-paginated "list records" API. The
//! engine consumes the endpoint as a black box: given filters, a sort key,
//! and an opaque cursor it returns one page of raw listing records plus the
//! next cursor and the total count.
//!
//! ## Input/Output Specification
//! - **Input**: Filter set, sort key, opaque cursor, page limit
//! - **Output**: One page of raw records, next cursor, total count
//! - **Cursor semantics**: Re-requesting the same cursor with unchanged
//!   filters returns the same page
//!
//! ## Key Features
//! - Duck-typed raw records projected to `LeanRecord` (string-typed numbers
//!   accepted, unparseable values become explicit missing)
//! - HTTP implementation with per-request timeout and status classification
//! - Trait boundary so tests can substitute an in-memory source

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::errors::{EngineError, Result};
use crate::filters::{FilterSet, FilterValue};
use crate::sorter::SortKey;
use crate::LeanRecord;

/// A raw listing record as returned by the upstream API.
///
/// Only `id` is guaranteed; every other field may be absent, null, or
/// string-typed. Fields the engine does not sort or display are captured in
/// `extra` and dropped at projection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(default)]
    pub price: Value,
    #[serde(default)]
    pub year: Value,
    #[serde(default)]
    pub mileage: Value,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Parse a duck-typed numeric field: JSON numbers and numeric strings are
/// accepted, everything else is an explicit missing value.
fn numeric_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

impl RawRecord {
    /// Lossy projection down to the six sort/display fields.
    ///
    /// This runs before accumulation so that very large result sets only
    /// ever hold lean records in memory.
    pub fn project(&self) -> LeanRecord {
        LeanRecord {
            id: self.id.clone(),
            price: numeric_field(&self.price),
            year: numeric_field(&self.year).map(|y| y as i32),
            mileage: numeric_field(&self.mileage),
            make: self.make.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            thumbnail: self.thumbnail.clone(),
        }
    }
}

/// One page of the upstream listing API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    /// Raw records for this page
    pub items: Vec<RawRecord>,
    /// Cursor for the next page; `None` means this is the last page
    pub next_cursor: Option<String>,
    /// Total records matching the filters
    pub total: usize,
}

/// The remote paginated listing API, consumed as a black box
#[async_trait]
pub trait PagedSource: Send + Sync {
    /// Human-readable source name for logging and error context
    fn name(&self) -> &str;

    /// Fetch a single page for the given filters, sort, and cursor
    async fn fetch_page(
        &self,
        filters: &FilterSet,
        sort: &SortKey,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<PageResponse>;
}

/// HTTP-backed paged source
pub struct HttpPagedSource {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpPagedSource {
    /// Create a source against a base URL with a per-request timeout
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            name: "listing-api".to_string(),
            base_url: base_url.into(),
            api_key,
            client,
        })
    }

    /// Flatten a filter set into query parameters
    fn filter_params(filters: &FilterSet) -> Vec<(String, String)> {
        let mut params = Vec::new();
        for (key, value) in filters.iter_active() {
            match value {
                FilterValue::Text(s) => params.push((key.to_string(), s.clone())),
                FilterValue::Number(n) => params.push((key.to_string(), n.to_string())),
                FilterValue::Flag(b) => params.push((key.to_string(), b.to_string())),
                FilterValue::List(items) => {
                    params.push((key.to_string(), items.join(",")));
                }
                FilterValue::Range { min, max } => {
                    if let Some(min) = min {
                        params.push((format!("{}_min", key), min.to_string()));
                    }
                    if let Some(max) = max {
                        params.push((format!("{}_max", key), max.to_string()));
                    }
                }
            }
        }
        params
    }
}

#[async_trait]
impl PagedSource for HttpPagedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(
        &self,
        filters: &FilterSet,
        sort: &SortKey,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<PageResponse> {
        let mut params = Self::filter_params(filters);
        params.push(("sort".to_string(), sort.signature()));
        params.push(("limit".to_string(), limit.to_string()));
        if let Some(cursor) = cursor {
            params.push(("cursor".to_string(), cursor.to_string()));
        }

        let mut request = self.client.get(&self.base_url).query(&params);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(EngineError::from_http_status(
                &self.name,
                status.as_u16(),
                details,
            ));
        }

        let page: PageResponse = response.json().await.map_err(|e| EngineError::Serialization {
            message: format!("malformed page from '{}': {}", self.name, e),
        })?;

        tracing::debug!(
            "fetched page from '{}': {} items, total {}, next cursor {}",
            self.name,
            page.items.len(),
            page.total,
            page.next_cursor.as_deref().unwrap_or("<end>")
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorter::{SortDirection, SortField};
    use serde_json::json;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_projection_accepts_string_numbers() {
        let raw: RawRecord = serde_json::from_value(json!({
            "id": "lot-1",
            "price": "12500.50",
            "year": 2019,
            "mileage": "not a number",
            "make": "Audi",
            "model": "A4",
            "auction_house": "north-yard",
            "description": "long text the projection must drop"
        }))
        .unwrap();

        let lean = raw.project();
        assert_eq!(lean.price, Some(12_500.5));
        assert_eq!(lean.year, Some(2019));
        assert_eq!(lean.mileage, None);
        assert_eq!(lean.make, "Audi");
        assert!(lean.thumbnail.is_none());
    }

    #[test]
    fn test_projection_never_coerces_missing_to_zero() {
        let raw: RawRecord = serde_json::from_value(json!({
            "id": "lot-2",
            "price": null,
            "make": "BMW",
            "model": "X5"
        }))
        .unwrap();
        assert_eq!(raw.project().price, None);
    }

    #[tokio::test]
    async fn test_http_source_parses_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("sort", "price:asc"))
            .and(query_param("limit", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "a", "price": 100, "make": "Audi", "model": "A4"},
                    {"id": "b", "price": "200", "make": "BMW", "model": "X5"}
                ],
                "nextCursor": "cursor-2",
                "total": 4
            })))
            .mount(&server)
            .await;

        let source =
            HttpPagedSource::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let key = SortKey::new(SortField::Price, SortDirection::Asc);
        let page = source
            .fetch_page(&FilterSet::new(), &key, None, 2)
            .await
            .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 4);
        assert_eq!(page.next_cursor.as_deref(), Some("cursor-2"));
        assert_eq!(page.items[1].project().price, Some(200.0));
    }

    #[tokio::test]
    async fn test_http_source_classifies_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let source =
            HttpPagedSource::new(server.uri(), None, Duration::from_secs(5)).unwrap();
        let key = SortKey::new(SortField::Year, SortDirection::Desc);
        let err = source
            .fetch_page(&FilterSet::new(), &key, None, 50)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let err = source
            .fetch_page(&FilterSet::new(), &key, None, 50)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory paged source with failure injection and call counting,
    //! shared by the aggregator and coordinator tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::LeanRecord;

    /// Key used to identify the first page (no cursor yet)
    pub const FIRST_PAGE: &str = "start";

    pub struct InMemorySource {
        records: Vec<LeanRecord>,
        /// Remaining injected failures per cursor key
        failures: Mutex<HashMap<String, u32>>,
        /// HTTP status used for injected failures
        failure_status: u16,
        /// Calls observed per cursor key
        calls: Mutex<HashMap<String, u32>>,
        /// Artificial latency per page, for cancellation tests
        page_delay: Duration,
    }

    impl InMemorySource {
        pub fn new(records: Vec<LeanRecord>) -> Self {
            Self {
                records,
                failures: Mutex::new(HashMap::new()),
                failure_status: 503,
                calls: Mutex::new(HashMap::new()),
                page_delay: Duration::ZERO,
            }
        }

        pub fn with_page_delay(mut self, delay: Duration) -> Self {
            self.page_delay = delay;
            self
        }

        pub fn with_failure_status(mut self, status: u16) -> Self {
            self.failure_status = status;
            self
        }

        /// Make the page identified by `cursor_key` fail `count` times
        /// before succeeding.
        pub fn fail_page(&self, cursor_key: &str, count: u32) {
            self.failures.lock().insert(cursor_key.to_string(), count);
        }

        /// Calls observed for one page
        pub fn calls_for(&self, cursor_key: &str) -> u32 {
            self.calls.lock().get(cursor_key).copied().unwrap_or(0)
        }

        /// Calls observed across all pages
        pub fn total_calls(&self) -> u32 {
            self.calls.lock().values().sum()
        }

        fn to_raw(record: &LeanRecord) -> RawRecord {
            let value = serde_json::to_value(record).expect("lean record serializes");
            serde_json::from_value(value).expect("lean record maps onto raw record")
        }
    }

    #[async_trait]
    impl PagedSource for InMemorySource {
        fn name(&self) -> &str {
            "in-memory"
        }

        async fn fetch_page(
            &self,
            _filters: &FilterSet,
            _sort: &SortKey,
            cursor: Option<&str>,
            limit: usize,
        ) -> Result<PageResponse> {
            let key = cursor.unwrap_or(FIRST_PAGE).to_string();
            *self.calls.lock().entry(key.clone()).or_insert(0) += 1;

            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            let should_fail = {
                let mut failures = self.failures.lock();
                match failures.get_mut(&key) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if should_fail {
                return Err(EngineError::from_http_status(
                    "in-memory",
                    self.failure_status,
                    format!("injected failure for page '{}'", key),
                ));
            }

            let offset = cursor
                .and_then(|c| c.strip_prefix('c'))
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0);
            let end = (offset + limit).min(self.records.len());
            let items = self.records[offset..end].iter().map(Self::to_raw).collect();
            let next_cursor = if end < self.records.len() {
                Some(format!("c{}", end))
            } else {
                None
            };

            Ok(PageResponse {
                items,
                next_cursor,
                total: self.records.len(),
            })
        }
    }
}
