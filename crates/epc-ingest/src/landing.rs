//! Landing batches into object storage
//!
//! One immutable, gzip-compressed NDJSON object per (partition, stage), at a
//! deterministic key. Rows are normalized and compressed as pages arrive, so
//! only the compressed batch is held in memory. A redo of the same partition
//! overwrites the same key.

use epc_common::checksum::sha256_hex;
use epc_common::types::{PartitionKey, Stage};
use epc_common::EpcError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::records::{MalformedPolicy, Normalizer, Record, RecordError};
use crate::storage::{ObjectStore, StorageError};

/// Default key root for landed objects
pub const DEFAULT_LANDING_ROOT: &str = "landing";

/// File name of the single part written per batch
pub const PART_FILE_NAME: &str = "part-0001.ndjson.gz";

pub const LANDED_CONTENT_TYPE: &str = "application/gzip";

#[derive(Error, Debug)]
pub enum LandingError {
    #[error("Malformed record: {0}")]
    MalformedRecord(#[from] RecordError),

    #[error("Failed to encode batch: {0}")]
    Encode(#[source] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to decode landed object {key}: {message}")]
    Decode { key: String, message: String },

    #[error("Failed to write {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    InvalidStage(#[from] EpcError),
}

/// A committed landed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandedObject {
    pub key: String,
    pub checksum: String,
    pub size: u64,
    pub records: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LandingReceipt {
    /// `None` when the batch was empty and nothing was written
    pub object: Option<LandedObject>,
    pub records: u64,
    pub skipped: u64,
    pub duplicates: u64,
}

#[derive(Clone)]
pub struct LandingWriter {
    store: Arc<dyn ObjectStore>,
    root: String,
    policy: MalformedPolicy,
}

impl LandingWriter {
    pub fn new(store: Arc<dyn ObjectStore>, policy: MalformedPolicy) -> Self {
        Self {
            store,
            root: DEFAULT_LANDING_ROOT.to_string(),
            policy,
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into().trim_matches('/').to_string();
        self
    }

    pub fn key_for(&self, partition: &PartitionKey, stage: Stage) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.root, partition.kind, partition.period, stage, PART_FILE_NAME
        )
    }

    pub fn begin(&self, partition: &PartitionKey, stage: Stage) -> Result<LandingBatch, LandingError> {
        partition.check_stage(stage)?;
        Ok(LandingBatch {
            store: self.store.clone(),
            key: self.key_for(partition, stage),
            normalizer: Normalizer::new(stage, self.policy),
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            records: 0,
        })
    }

    /// Read back a landed object
    pub async fn read(&self, key: &str) -> Result<Option<Vec<Record>>, LandingError> {
        let data = self
            .store
            .get(key)
            .await
            .map_err(|source| LandingError::Store {
                key: key.to_string(),
                source,
            })?;
        data.map(|bytes| decode_batch(key, &bytes)).transpose()
    }
}

/// An open batch; nothing is visible in storage until [`LandingBatch::finish`]
pub struct LandingBatch {
    store: Arc<dyn ObjectStore>,
    key: String,
    normalizer: Normalizer,
    encoder: GzEncoder<Vec<u8>>,
    records: u64,
}

impl LandingBatch {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Normalize and append a page of raw rows; returns how many were kept
    pub fn push_rows(&mut self, rows: Vec<Value>) -> Result<usize, LandingError> {
        let mut kept = 0;
        for row in rows {
            if let Some(record) = self.normalizer.push(row)? {
                serde_json::to_writer(&mut self.encoder, &record)?;
                self.encoder.write_all(b"\n").map_err(LandingError::Encode)?;
                kept += 1;
            }
        }
        self.records += kept as u64;
        Ok(kept)
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Commit the batch; an empty batch writes nothing
    pub async fn finish(self) -> Result<LandingReceipt, LandingError> {
        let skipped = self.normalizer.skipped() as u64;
        let duplicates = self.normalizer.duplicates() as u64;

        if self.records == 0 {
            debug!(key = %self.key, skipped, "Empty batch, nothing landed");
            return Ok(LandingReceipt {
                object: None,
                records: 0,
                skipped,
                duplicates,
            });
        }

        let compressed = self.encoder.finish().map_err(LandingError::Encode)?;
        let checksum = sha256_hex(&compressed);
        let receipt = self
            .store
            .put(&self.key, compressed, LANDED_CONTENT_TYPE)
            .await
            .map_err(|source| LandingError::Store {
                key: self.key.clone(),
                source,
            })?;

        info!(
            key = %self.key,
            records = self.records,
            skipped,
            duplicates,
            size = receipt.size,
            "Landed batch"
        );

        Ok(LandingReceipt {
            object: Some(LandedObject {
                key: self.key,
                checksum,
                size: receipt.size,
                records: self.records,
            }),
            records: self.records,
            skipped,
            duplicates,
        })
    }
}

/// Decode gzip NDJSON produced by [`LandingBatch`]
pub fn decode_batch(key: &str, data: &[u8]) -> Result<Vec<Record>, LandingError> {
    let decode_err = |message: String| LandingError::Decode {
        key: key.to_string(),
        message,
    };

    let reader = BufReader::new(GzDecoder::new(data));
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| decode_err(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .map_err(|e| decode_err(format!("line {}: {}", line_no + 1, e)))?;
        records.push(record);
    }
    Ok(records)
}
