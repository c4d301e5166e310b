//! Object storage for landed batches and checkpoint documents
//!
//! Keys are `/`-separated relative paths. Writes to an existing key replace
//! it; deletes of a missing key succeed.

use async_trait::async_trait;
use epc_common::checksum::sha256_hex;
use std::sync::Arc;
use thiserror::Error;

pub mod config;
pub mod local;
pub mod s3;

pub use config::{StorageBackend, StorageConfig};
pub use local::LocalStore;
pub use s3::S3Store;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage {operation} failed for {key}: {message}")]
    Backend {
        operation: &'static str,
        key: String,
        message: String,
    },
}

impl StorageError {
    pub(crate) fn backend(
        operation: &'static str,
        key: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        StorageError::Backend {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub checksum: String,
    pub size: u64,
}

impl PutReceipt {
    pub(crate) fn for_data(key: &str, data: &[u8]) -> Self {
        Self {
            key: key.to_string(),
            checksum: sha256_hex(data),
            size: data.len() as u64,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, e.g. `s3://bucket/prefix`
    fn location(&self) -> String;

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str)
        -> Result<PutReceipt, StorageError>;

    /// Object contents, or `None` if the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject keys that could escape the store root or collide with directories
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

/// Open the configured backend
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match config.backend {
        StorageBackend::S3 => Ok(Arc::new(S3Store::new(config).await?)),
        StorageBackend::Local => Ok(Arc::new(LocalStore::new(&config.local_root)?)),
    }
}
