//! Shared fixtures for epc-ingest integration tests
//!
//! The upstream API is a `wiremock` server, objects live in a temporary
//! directory and the warehouse is the in-memory backend, so these tests need
//! no external services.

#![allow(dead_code)]

use async_trait::async_trait;
use epc_ingest::checkpoint::{CheckpointStore, DEFAULT_CHECKPOINT_ROOT};
use epc_ingest::client::{EpcClient, RetryPolicy, NEXT_SEARCH_AFTER_HEADER};
use epc_ingest::config::{ApiConfig, Secret};
use epc_ingest::landing::LandingWriter;
use epc_ingest::orchestrator::Orchestrator;
use epc_ingest::recommendations::ArchiveFetcher;
use epc_ingest::records::MalformedPolicy;
use epc_ingest::storage::{LocalStore, ObjectStore, PutReceipt, StorageError};
use epc_ingest::warehouse::{MemoryWarehouse, WarehouseLoader};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_EMAIL: &str = "test@example.org";
pub const TEST_API_KEY: &str = "secret";

/// Base64 of `TEST_EMAIL:TEST_API_KEY`
pub const TEST_BASIC_AUTH: &str = "Basic dGVzdEBleGFtcGxlLm9yZzpzZWNyZXQ=";

/// Three attempts with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

pub fn api_config(server: &MockServer) -> ApiConfig {
    ApiConfig {
        base_url: server.uri(),
        email: TEST_EMAIL.to_string(),
        api_key: Secret::new(TEST_API_KEY),
        page_size: 2,
        request_timeout_secs: 5,
    }
}

pub fn client(server: &MockServer) -> EpcClient {
    EpcClient::new(&api_config(server), fast_retry()).unwrap()
}

/// A certificate row as the search endpoint returns it
pub fn certificate(lmk_key: &str, lodgement_date: &str) -> Value {
    json!({
        "lmk-key": lmk_key,
        "lodgement-date": lodgement_date,
        "postcode": "SW1A 1AA",
        "uprn": "100023336956",
        "current-energy-rating": "C"
    })
}

/// Mount a cursor walk for one month
///
/// Page `i` is served for `search-after=tok-{i}` (the first page for no
/// token) and carries `tok-{i+1}` unless it is the last page. An empty
/// `pages` mounts a single empty page. Each page mock expects exactly
/// `times` calls.
pub async fn mount_month(
    server: &MockServer,
    kind: &str,
    year: u16,
    month: u8,
    pages: Vec<Vec<Value>>,
    times: u64,
) {
    let pages = if pages.is_empty() { vec![Vec::new()] } else { pages };
    let last = pages.len() - 1;

    for (index, rows) in pages.into_iter().enumerate() {
        let mut response = ResponseTemplate::new(200).set_body_json(json!({ "rows": rows }));
        if index < last {
            response = response.insert_header(NEXT_SEARCH_AFTER_HEADER, format!("tok-{}", index + 1));
        }

        let mock = Mock::given(method("GET"))
            .and(path(format!("/{}/search", kind)))
            .and(query_param("from-year", year.to_string()))
            .and(query_param("from-month", month.to_string()));
        let mock = if index == 0 {
            mock.and(query_param_is_missing("search-after"))
        } else {
            mock.and(query_param("search-after", format!("tok-{}", index)))
        };

        mock.respond_with(response).expect(times).mount(server).await;
    }
}

/// Mount a month whose search always answers `status`
pub async fn mount_month_status(
    server: &MockServer,
    kind: &str,
    year: u16,
    month: u8,
    status: u16,
    times: u64,
) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/search", kind)))
        .and(query_param("from-year", year.to_string()))
        .and(query_param("from-month", month.to_string()))
        .respond_with(ResponseTemplate::new(status))
        .expect(times)
        .mount(server)
        .await;
}

pub async fn mount_recommendations(server: &MockServer, kind: &str, lmk_key: &str, rows: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/recommendations/{}", kind, lmk_key)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "rows": rows })))
        .mount(server)
        .await;
}

/// Object store that can be told to reject checkpoint writes
///
/// Simulates a crash after the warehouse load committed but before the
/// checkpoint was recorded.
pub struct FlakyCheckpoints {
    inner: Arc<dyn ObjectStore>,
    fail: AtomicBool,
}

impl FlakyCheckpoints {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FlakyCheckpoints {
    fn location(&self) -> String {
        self.inner.location()
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<PutReceipt, StorageError> {
        if self.fail.load(Ordering::SeqCst) && key.starts_with(DEFAULT_CHECKPOINT_ROOT) {
            return Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::other("simulated crash"),
            });
        }
        self.inner.put(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

/// Object store that holds landing writes open for a while and records how
/// many were in flight at once
///
/// Each partition stage lands exactly one object, so the peak is the number
/// of partitions working at the same time.
pub struct SlowLanding {
    inner: Arc<dyn ObjectStore>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowLanding {
    pub fn new(inner: Arc<dyn ObjectStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for SlowLanding {
    fn location(&self) -> String {
        self.inner.location()
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<PutReceipt, StorageError> {
        if key.starts_with(DEFAULT_CHECKPOINT_ROOT) {
            return self.inner.put(key, data, content_type).await;
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.put(key, data, content_type).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

/// Temporary object store plus in-memory warehouse
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<MemoryWarehouse>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        Self {
            dir,
            store,
            warehouse: Arc::new(MemoryWarehouse::new()),
        }
    }

    /// Swap the object store, keeping the directory alive
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = store;
        self
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.store.clone())
    }

    /// Orchestrator without a warehouse, for dry runs
    pub fn planner(&self, server: &MockServer) -> Orchestrator {
        self.planner_with_archives(server, ArchiveFetcher::new(fast_retry()).unwrap())
    }

    pub fn planner_with_archives(&self, server: &MockServer, archives: ArchiveFetcher) -> Orchestrator {
        Orchestrator::new(
            client(server),
            self.checkpoints(),
            LandingWriter::new(self.store.clone(), MalformedPolicy::Fail),
            archives,
        )
        .with_concurrency(2)
    }

    pub fn orchestrator(&self, server: &MockServer) -> Orchestrator {
        self.with_loader(self.planner(server))
    }

    pub fn orchestrator_with_archives(&self, server: &MockServer, archives: ArchiveFetcher) -> Orchestrator {
        self.with_loader(self.planner_with_archives(server, archives))
    }

    fn with_loader(&self, orchestrator: Orchestrator) -> Orchestrator {
        orchestrator.with_loader(WarehouseLoader::new(self.warehouse.clone(), self.store.clone()))
    }
}
