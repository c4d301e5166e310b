//! Configuration management
//!
//! [`IngestConfig`] is assembled once at startup from the process environment
//! (after `.env` has been loaded) and passed by value to the components that
//! need it. Nothing reads the environment after that point.

use epc_common::types::Month;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::client::RetryPolicy;
use crate::records::MalformedPolicy;
use crate::storage::config::StorageConfig;

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

/// Upstream API base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://epc.opendatacommunities.org/api/v1";

/// Rows requested per search page.
pub const DEFAULT_PAGE_SIZE: u32 = 5000;

/// Per-attempt HTTP timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Total attempts per request, including the first.
pub const DEFAULT_RETRY_MAX: u32 = 5;

/// Base backoff delay in seconds, doubled on every retry.
pub const DEFAULT_RETRY_BACKOFF_SECS: f64 = 2.0;

/// Upper bound for a single backoff delay in seconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_SECS: f64 = 120.0;

/// Partitions processed concurrently.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Warehouse schema holding the raw tables.
pub const DEFAULT_WAREHOUSE_SCHEMA: &str = "epc_raw";

/// Maximum warehouse connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Opaque credential that never appears in logs or `Debug` output
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<unset>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

/// Upstream API access
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub email: String,
    pub api_key: Secret,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn has_credentials(&self) -> bool {
        !self.email.is_empty() && !self.api_key.is_empty()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            email: String::new(),
            api_key: Secret::default(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Analytical warehouse connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Postgres URL; `None` disables loading (dry runs, status queries)
    pub database_url: Option<String>,
    pub schema: String,
    pub max_connections: u32,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schema: DEFAULT_WAREHOUSE_SCHEMA.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
        }
    }
}

/// Everything a run needs, fixed at startup
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api: ApiConfig,
    pub retry: RetryPolicy,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    pub concurrency: usize,
    pub start_month: Option<Month>,
    pub end_month: Option<Month>,
    pub malformed_policy: MalformedPolicy,
    /// Wall-clock budget for a whole run
    pub run_deadline_secs: Option<u64>,
    /// Yearly recommendations archive, with `{kind}` and `{year}` placeholders
    pub recs_archive_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            retry: RetryPolicy::default(),
            storage: StorageConfig::default(),
            warehouse: WarehouseConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
            start_month: None,
            end_month: None,
            malformed_policy: MalformedPolicy::default(),
            run_deadline_secs: None,
            recs_archive_url: None,
        }
    }
}

/// An optional variable; a value that does not parse is an error naming the variable
pub(crate) fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| anyhow::anyhow!("{}: invalid value {:?}: {}", key, s, e))
        })
        .transpose()
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> anyhow::Result<Duration> {
    let secs = parsed::<f64>(lookup, key)?.unwrap_or(default);
    if !secs.is_finite() || secs < 0.0 {
        anyhow::bail!("{}: must be a non-negative number of seconds", key);
    }
    Ok(Duration::from_secs_f64(secs))
}

impl IngestConfig {
    /// Load configuration from `.env` (or the file named by `ENV_FILE`) and the environment
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("ENV_FILE") {
            Ok(path) => {
                dotenvy::from_filename(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to load env file {}: {}", path, e))?;
            },
            Err(_) => {
                dotenvy::dotenv().ok();
            },
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let month = |key: &str| -> anyhow::Result<Option<Month>> {
            lookup(key)
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.parse::<Month>())
                .transpose()
                .map_err(|e| anyhow::anyhow!("{}: {}", key, e))
        };

        let malformed_policy = match lookup("INGEST_MALFORMED_POLICY") {
            Some(value) => value.parse()?,
            None => MalformedPolicy::default(),
        };

        let config = IngestConfig {
            api: ApiConfig {
                base_url: lookup("EPC_API_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
                email: lookup("EPC_EMAIL").unwrap_or_default(),
                api_key: Secret::new(lookup("EPC_API_KEY").unwrap_or_default()),
                page_size: parsed(&lookup, "EPC_PAGE_SIZE")?.unwrap_or(DEFAULT_PAGE_SIZE),
                request_timeout_secs: parsed(&lookup, "EPC_REQUEST_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            },
            retry: RetryPolicy {
                max_attempts: parsed(&lookup, "EPC_RETRY_MAX")?.unwrap_or(DEFAULT_RETRY_MAX),
                backoff_base: seconds(&lookup, "EPC_RETRY_BACKOFF_SECS", DEFAULT_RETRY_BACKOFF_SECS)?,
                max_backoff: seconds(
                    &lookup,
                    "EPC_RETRY_MAX_BACKOFF_SECS",
                    DEFAULT_RETRY_MAX_BACKOFF_SECS,
                )?,
            },
            storage: StorageConfig::from_lookup(&lookup)?,
            warehouse: WarehouseConfig {
                database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
                schema: lookup("WAREHOUSE_SCHEMA")
                    .unwrap_or_else(|| DEFAULT_WAREHOUSE_SCHEMA.to_string()),
                max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            },
            concurrency: parsed(&lookup, "INGEST_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY),
            start_month: month("INGEST_START_MONTH")?,
            end_month: month("INGEST_END_MONTH")?,
            malformed_policy,
            run_deadline_secs: parsed(&lookup, "INGEST_RUN_DEADLINE_SECS")?,
            recs_archive_url: lookup("INGEST_RECS_ARCHIVE_URL").filter(|s| !s.is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.page_size == 0 {
            anyhow::bail!("EPC page size must be greater than 0");
        }

        if self.api.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("Retry max attempts must be at least 1");
        }

        if self.concurrency == 0 {
            anyhow::bail!("Concurrency must be greater than 0");
        }

        if let (Some(start), Some(end)) = (self.start_month, self.end_month) {
            if end < start {
                anyhow::bail!("INGEST_END_MONTH ({}) is before INGEST_START_MONTH ({})", end, start);
            }
        }

        if self.warehouse.schema.is_empty()
            || !self
                .warehouse
                .schema
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("Warehouse schema must be a plain identifier: {:?}", self.warehouse.schema);
        }

        self.storage.validate()?;

        Ok(())
    }

    /// Fail unless upstream credentials are present
    pub fn require_credentials(&self) -> anyhow::Result<()> {
        if !self.api.has_credentials() {
            anyhow::bail!("EPC_EMAIL and EPC_API_KEY must be set");
        }
        Ok(())
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }
}
