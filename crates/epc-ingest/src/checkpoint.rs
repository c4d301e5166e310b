//! Durable per-(partition, stage) completion markers
//!
//! Each marker is one JSON document at `{root}/{kind}/{period}/{stage}.json`.
//! Absence means the stage was never completed. A present marker, either
//! `done` or `no-data`, is final until an explicit [`CheckpointStore::clear`].
//! Markers for different keys never interact, so concurrent partitions can
//! write without coordination.

use chrono::{DateTime, Utc};
use epc_common::types::{Kind, PartitionKey, Period, PeriodRange, Stage};
use epc_common::EpcError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::storage::{ObjectStore, StorageError};

/// Default key root for checkpoint documents
pub const DEFAULT_CHECKPOINT_ROOT: &str = "state";

/// Schema version written into every document
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint store error at {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Checkpoint document {key} is unreadable: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint document {key} describes {found}")]
    Mismatch { key: String, found: String },

    #[error(transparent)]
    InvalidStage(#[from] EpcError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointStatus {
    Done,
    /// Completed with nothing to ingest
    NoData,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Done => "done",
            CheckpointStatus::NoData => "no-data",
        }
    }
}

/// What was produced when the stage completed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub records: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub duplicates: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDocument {
    pub kind: Kind,
    pub period: Period,
    pub stage: Stage,
    pub status: CheckpointStatus,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub meta: CheckpointMeta,
    pub version: u32,
}

impl CheckpointDocument {
    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.kind, self.period.clone())
    }
}

#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_root(store, DEFAULT_CHECKPOINT_ROOT)
    }

    pub fn with_root(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into().trim_matches('/').to_string(),
        }
    }

    pub fn key_for(&self, partition: &PartitionKey, stage: Stage) -> String {
        format!(
            "{}/{}/{}/{}.json",
            self.root, partition.kind, partition.period, stage
        )
    }

    /// Inverse of [`Self::key_for`] for keys under `{root}/{kind}/`
    fn parse_key(&self, kind: Kind, key: &str) -> Option<(Period, Stage)> {
        let rest = key.strip_prefix(&format!("{}/{}/", self.root, kind))?;
        let (period, file) = rest.split_once('/')?;
        let stage = file.strip_suffix(".json")?;
        Some((period.parse().ok()?, stage.parse().ok()?))
    }

    /// Read the marker, if any
    ///
    /// Store failures and unreadable documents are errors, never "absent".
    pub async fn load(
        &self,
        partition: &PartitionKey,
        stage: Stage,
    ) -> Result<Option<CheckpointDocument>, CheckpointError> {
        let key = self.key_for(partition, stage);
        let data = self
            .store
            .get(&key)
            .await
            .map_err(|source| CheckpointError::Store {
                key: key.clone(),
                source,
            })?;

        let Some(data) = data else {
            return Ok(None);
        };

        let doc: CheckpointDocument =
            serde_json::from_slice(&data).map_err(|source| CheckpointError::Corrupt {
                key: key.clone(),
                source,
            })?;

        if doc.kind != partition.kind || doc.period != partition.period || doc.stage != stage {
            return Err(CheckpointError::Mismatch {
                key,
                found: format!("{} {}", doc.partition(), doc.stage),
            });
        }

        Ok(Some(doc))
    }

    pub async fn status(
        &self,
        partition: &PartitionKey,
        stage: Stage,
    ) -> Result<Option<CheckpointStatus>, CheckpointError> {
        Ok(self.load(partition, stage).await?.map(|doc| doc.status))
    }

    pub async fn is_done(&self, partition: &PartitionKey, stage: Stage) -> Result<bool, CheckpointError> {
        Ok(self.status(partition, stage).await?.is_some())
    }

    /// Record that `stage` completed for `partition`
    ///
    /// Must only be called after the stage's output is durable.
    #[instrument(skip(self, meta), fields(partition = %partition, stage = %stage))]
    pub async fn mark_done(
        &self,
        partition: &PartitionKey,
        stage: Stage,
        status: CheckpointStatus,
        meta: CheckpointMeta,
    ) -> Result<CheckpointDocument, CheckpointError> {
        partition.check_stage(stage)?;

        let doc = CheckpointDocument {
            kind: partition.kind,
            period: partition.period.clone(),
            stage,
            status,
            ts: Utc::now(),
            meta,
            version: CHECKPOINT_VERSION,
        };

        let key = self.key_for(partition, stage);
        let body = serde_json::to_vec_pretty(&doc).map_err(|source| CheckpointError::Corrupt {
            key: key.clone(),
            source,
        })?;

        self.store
            .put(&key, body, "application/json")
            .await
            .map_err(|source| CheckpointError::Store {
                key: key.clone(),
                source,
            })?;

        debug!(status = status.as_str(), "Checkpoint written to {}", key);
        Ok(doc)
    }

    /// All markers of `kind` whose period falls in `range`, sorted by key
    pub async fn list(
        &self,
        kind: Kind,
        range: &PeriodRange,
    ) -> Result<Vec<CheckpointDocument>, CheckpointError> {
        let mut docs = Vec::new();
        for (period, stage) in self.matching_keys(kind, range, &Stage::ALL).await? {
            let partition = PartitionKey::new(kind, period);
            if let Some(doc) = self.load(&partition, stage).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Delete markers of `kind` in `range` for the given stages
    ///
    /// Returns the deleted keys. Nothing outside the range/stage filter is touched.
    #[instrument(skip(self))]
    pub async fn clear(
        &self,
        kind: Kind,
        range: &PeriodRange,
        stages: &[Stage],
    ) -> Result<Vec<String>, CheckpointError> {
        let mut cleared = Vec::new();
        for (period, stage) in self.matching_keys(kind, range, stages).await? {
            let key = self.key_for(&PartitionKey::new(kind, period), stage);
            self.store
                .delete(&key)
                .await
                .map_err(|source| CheckpointError::Store {
                    key: key.clone(),
                    source,
                })?;
            cleared.push(key);
        }

        info!(kind = %kind, cleared = cleared.len(), "Cleared checkpoints");
        Ok(cleared)
    }

    async fn matching_keys(
        &self,
        kind: Kind,
        range: &PeriodRange,
        stages: &[Stage],
    ) -> Result<Vec<(Period, Stage)>, CheckpointError> {
        let prefix = format!("{}/{}/", self.root, kind);
        let keys = self
            .store
            .list(&prefix)
            .await
            .map_err(|source| CheckpointError::Store {
                key: prefix.clone(),
                source,
            })?;

        Ok(keys
            .iter()
            .filter_map(|key| self.parse_key(kind, key))
            .filter(|(period, stage)| range.contains(period) && stages.contains(stage))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use epc_common::types::Month;

    fn store() -> (tempfile::TempDir, CheckpointStore, Arc<dyn ObjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        (dir, CheckpointStore::new(objects.clone()), objects)
    }

    fn month(s: &str) -> PartitionKey {
        PartitionKey::month(Kind::Domestic, s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_absent_then_done() {
        let (_dir, checkpoints, _) = store();
        let p = month("2024-01");

        assert!(!checkpoints.is_done(&p, Stage::Certs).await.unwrap());

        let meta = CheckpointMeta {
            records: 10,
            ..Default::default()
        };
        checkpoints
            .mark_done(&p, Stage::Certs, CheckpointStatus::Done, meta)
            .await
            .unwrap();

        assert!(checkpoints.is_done(&p, Stage::Certs).await.unwrap());
        assert!(!checkpoints.is_done(&p, Stage::Recs).await.unwrap());
        let doc = checkpoints.load(&p, Stage::Certs).await.unwrap().unwrap();
        assert_eq!(doc.meta.records, 10);
        assert_eq!(doc.version, CHECKPOINT_VERSION);
    }

    #[tokio::test]
    async fn test_document_layout() {
        let (_dir, checkpoints, objects) = store();
        let p = PartitionKey::month(Kind::NonDomestic, "2024-02".parse().unwrap());
        checkpoints
            .mark_done(&p, Stage::Certs, CheckpointStatus::NoData, CheckpointMeta::default())
            .await
            .unwrap();

        let raw = objects
            .get("state/non-domestic/2024-02/certs.json")
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["status"], "no-data");
        assert_eq!(json["kind"], "non-domestic");
        assert_eq!(json["period"], "2024-02");
        assert_eq!(json["stage"], "certs");
        assert_eq!(json["version"], 1);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_error() {
        let (_dir, checkpoints, objects) = store();
        let p = month("2024-01");
        objects
            .put(&checkpoints.key_for(&p, Stage::Certs), b"{not json".to_vec(), "application/json")
            .await
            .unwrap();

        let err = checkpoints.is_done(&p, Stage::Certs).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_invalid_stage_rejected() {
        let (_dir, checkpoints, _) = store();
        let p = PartitionKey::new(Kind::Domestic, Period::Year(2024));
        let err = checkpoints
            .mark_done(&p, Stage::Certs, CheckpointStatus::Done, CheckpointMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidStage(_)));
    }

    #[tokio::test]
    async fn test_clear_respects_range_and_stage() {
        let (_dir, checkpoints, _) = store();
        for m in ["2024-01", "2024-02", "2024-03"] {
            for stage in Stage::ALL {
                checkpoints
                    .mark_done(&month(m), stage, CheckpointStatus::Done, CheckpointMeta::default())
                    .await
                    .unwrap();
            }
        }
        let other_kind = PartitionKey::month(Kind::NonDomestic, "2024-02".parse().unwrap());
        checkpoints
            .mark_done(&other_kind, Stage::Certs, CheckpointStatus::Done, CheckpointMeta::default())
            .await
            .unwrap();

        let range = PeriodRange::months(
            "2024-02".parse::<Month>().unwrap(),
            "2024-03".parse::<Month>().unwrap(),
        )
        .unwrap();
        let cleared = checkpoints.clear(Kind::Domestic, &range, &[Stage::Certs]).await.unwrap();
        assert_eq!(cleared.len(), 2);

        assert!(checkpoints.is_done(&month("2024-01"), Stage::Certs).await.unwrap());
        assert!(!checkpoints.is_done(&month("2024-02"), Stage::Certs).await.unwrap());
        assert!(!checkpoints.is_done(&month("2024-03"), Stage::Certs).await.unwrap());
        assert!(checkpoints.is_done(&month("2024-02"), Stage::Recs).await.unwrap());
        assert!(checkpoints.is_done(&other_kind, Stage::Certs).await.unwrap());

        let remaining = checkpoints.list(Kind::Domestic, &range).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|d| d.stage == Stage::Recs));
    }
}
