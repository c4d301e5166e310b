//! EPC Open Data Communities API client
//!
//! Certificate search is cursor-paginated: each response carries the token
//! for the next page in the `X-Next-Search-After` header. A [`Paginator`]
//! walks that cursor from the beginning and cannot be resumed part way, so a
//! failed walk is redone from page one.

use epc_common::types::{Kind, Month};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, instrument};

use crate::config::{ApiConfig, Secret};

pub mod error;
pub mod retry;

pub use error::FetchError;
pub use retry::RetryPolicy;

/// Response header carrying the continuation token
pub const NEXT_SEARCH_AFTER_HEADER: &str = "x-next-search-after";

/// One page of raw rows
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based position in the walk
    pub number: u32,
    pub rows: Vec<Value>,
}

/// Authenticated client for the EPC API
#[derive(Clone)]
pub struct EpcClient {
    http: reqwest::Client,
    base_url: String,
    email: String,
    api_key: Secret,
    page_size: u32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for EpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpcClient")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl EpcClient {
    pub fn new(api: &ApiConfig, retry: RetryPolicy) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(api.request_timeout())
            .user_agent(concat!("epc-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::terminal(None, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            email: api.email.clone(),
            api_key: api.api_key.clone(),
            page_size: api.page_size,
            retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Start a fresh cursor walk over all certificates of `kind` lodged in `month`
    pub fn search(&self, kind: Kind, month: Month) -> Paginator {
        Paginator {
            client: self.clone(),
            kind,
            month,
            token: None,
            seen_tokens: HashSet::new(),
            pages: 0,
            finished: false,
        }
    }

    /// Recommendation rows for one certificate; an unknown certificate has none
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn recommendations(&self, kind: Kind, lmk_key: &str) -> Result<Vec<Value>, FetchError> {
        let url = format!("{}/{}/recommendations/{}", self.base_url, kind.as_str(), lmk_key);

        let body = self
            .retry
            .run("recommendations request", |_| self.get_json(&url, &[], true))
            .await?;

        match body {
            Some((body, _)) => rows_from_body(body),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_page(
        &self,
        kind: Kind,
        month: Month,
        search_after: Option<&str>,
    ) -> Result<(Vec<Value>, Option<String>), FetchError> {
        let url = format!("{}/{}/search", self.base_url, kind.as_str());

        let mut query = vec![
            ("from-year", month.year().to_string()),
            ("from-month", month.month().to_string()),
            ("to-year", month.year().to_string()),
            ("to-month", month.month().to_string()),
            ("size", self.page_size.to_string()),
        ];
        if let Some(token) = search_after {
            query.push(("search-after", token.to_string()));
        }

        let (body, token) = self
            .retry
            .run("search request", |_| self.get_json(&url, &query, false))
            .await?
            .ok_or_else(|| FetchError::terminal(Some(404), "search endpoint not found"))?;

        Ok((rows_from_body(body)?, token))
    }

    /// One GET attempt; `Ok(None)` means 404 when `missing_ok` is set
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        missing_ok: bool,
    ) -> Result<Option<(Value, Option<String>)>, FetchError> {
        let response = self
            .http
            .get(url)
            .basic_auth(&self.email, Some(self.api_key.expose()))
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if missing_ok && status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status.as_u16(), &body));
        }

        let token = response
            .headers()
            .get(NEXT_SEARCH_AFTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);

        let bytes = response.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            FetchError::terminal(Some(status.as_u16()), format!("response body is not JSON: {}", e))
        })?;

        Ok(Some((body, token)))
    }
}

/// Accept both `{"rows": [...]}` and a bare array
fn rows_from_body(body: Value) -> Result<Vec<Value>, FetchError> {
    match body {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut map) => match map.remove("rows") {
            Some(Value::Array(rows)) => Ok(rows),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(FetchError::terminal(None, "\"rows\" is not an array")),
        },
        _ => Err(FetchError::terminal(None, "unexpected response body shape")),
    }
}

/// Lazy, finite, restart-only walk over search pages
///
/// Yields `Ok(Some(page))` per non-empty page, then `Ok(None)` once the API
/// returns an empty page or no continuation token. A continuation token seen
/// earlier in the walk is a terminal error, so a cycling cursor cannot loop
/// forever. After the end or any error the paginator stays finished.
#[derive(Debug)]
pub struct Paginator {
    client: EpcClient,
    kind: Kind,
    month: Month,
    token: Option<String>,
    seen_tokens: HashSet<String>,
    pages: u32,
    finished: bool,
}

impl Paginator {
    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if self.finished {
            return Ok(None);
        }

        let (rows, next) = match self
            .client
            .fetch_page(self.kind, self.month, self.token.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.finished = true;
                return Err(e);
            },
        };

        if rows.is_empty() {
            debug!(kind = %self.kind, month = %self.month, pages = self.pages, "Empty page, pagination complete");
            self.finished = true;
            return Ok(None);
        }

        if let Some(token) = &next {
            if !self.seen_tokens.insert(token.clone()) {
                self.finished = true;
                return Err(FetchError::terminal(
                    None,
                    format!("continuation token {:?} was already used", token),
                ));
            }
        }

        self.pages += 1;
        match next {
            Some(token) => self.token = Some(token),
            None => self.finished = true,
        }

        Ok(Some(Page {
            number: self.pages,
            rows,
        }))
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_from_body_shapes() {
        assert_eq!(rows_from_body(json!([{"a": 1}])).unwrap().len(), 1);
        assert_eq!(rows_from_body(json!({"rows": [{"a": 1}, {"a": 2}]})).unwrap().len(), 2);
        assert!(rows_from_body(json!({})).unwrap().is_empty());
        assert!(rows_from_body(json!({"rows": "x"})).is_err());
        assert!(rows_from_body(json!("text")).is_err());
    }

    #[test]
    fn test_debug_hides_api_key() {
        let api = ApiConfig {
            api_key: Secret::new("hunter2"),
            ..ApiConfig::default()
        };
        let client = EpcClient::new(&api, RetryPolicy::default()).unwrap();
        assert!(!format!("{:?}", client).contains("hunter2"));
    }
}
