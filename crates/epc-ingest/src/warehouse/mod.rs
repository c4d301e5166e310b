//! Loading landed objects into the analytical warehouse
//!
//! One append-only table per (kind, stage). A table's layout (partition
//! column plus clustering columns) is fixed when it is first created; a load
//! into a table with a different layout fails instead of altering it.
//!
//! Loads are idempotent per landed object: the job id is derived from the
//! object key, and the warehouse keeps a ledger of completed jobs.

use async_trait::async_trait;
use epc_common::checksum::{sha256_hex, verify_checksum};
use epc_common::types::{Kind, Stage};
use epc_common::EpcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

use crate::landing::{decode_batch, LandedObject, LandingError};
use crate::records::Record;
use crate::storage::{ObjectStore, StorageError};

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

/// Column every table is partitioned on
pub const PARTITION_COLUMN: &str = "lodgement_date";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLayout {
    pub partition_column: String,
    pub clustering: Vec<String>,
}

impl TableLayout {
    /// Expected layout of the table holding `stage` output for `kind`
    pub fn for_target(kind: Kind, stage: Stage) -> Self {
        let clustering: &[&str] = match (kind, stage) {
            (Kind::Domestic, Stage::Certs) => &["lmk_key", "postcode", "uprn"],
            (Kind::NonDomestic, Stage::Certs) => &["lmk_key"],
            (_, Stage::Recs) => &["lmk_key"],
        };
        Self {
            partition_column: PARTITION_COLUMN.to_string(),
            clustering: clustering.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl fmt::Display for TableLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition by {} cluster by [{}]",
            self.partition_column,
            self.clustering.join(", ")
        )
    }
}

pub fn table_name(kind: Kind, stage: Stage) -> String {
    match stage {
        Stage::Certs => format!("{}_raw_json", kind.table_slug()),
        Stage::Recs => format!("{}_recommendations_raw_json", kind.table_slug()),
    }
}

/// Deterministic load job id for a landed object
pub fn load_job_id(object_key: &str) -> String {
    format!("epc_load_{}", &sha256_hex(object_key.as_bytes())[..24])
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Table {table} exists with layout ({found}), expected ({expected})")]
    LayoutConflict {
        table: String,
        expected: TableLayout,
        found: TableLayout,
    },

    #[error("Landed object {0} does not exist")]
    MissingObject(String),

    #[error("Landed object {key} failed verification: {source}")]
    Integrity {
        key: String,
        #[source]
        source: EpcError,
    },

    #[error("Failed to read landed object {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Decode(#[from] LandingError),

    #[error("Warehouse database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One landed object's rows, bound for one table
#[derive(Debug, Clone)]
pub struct LoadJob {
    pub job_id: String,
    pub table: String,
    pub source_object: String,
    pub checksum: String,
    pub rows: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadDisposition {
    /// Rows inserted for the first time
    Loaded,
    /// Same job with the same content already committed; nothing changed
    AlreadyLoaded,
    /// Same job with different content; previous rows replaced
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReceipt {
    pub job_id: String,
    pub table: String,
    pub rows: u64,
    pub disposition: LoadDisposition,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset and bookkeeping tables if missing
    async fn ensure_schema(&self) -> Result<(), LoadError>;

    async fn table_layout(&self, table: &str) -> Result<Option<TableLayout>, LoadError>;

    /// Create `table` with `layout`; a no-op if it already exists
    async fn create_table(&self, table: &str, layout: &TableLayout) -> Result<(), LoadError>;

    /// Commit a job atomically; see [`LoadDisposition`]
    async fn submit_load(&self, job: LoadJob) -> Result<LoadDisposition, LoadError>;
}

#[derive(Clone)]
pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    store: Arc<dyn ObjectStore>,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, store: Arc<dyn ObjectStore>) -> Self {
        Self { warehouse, store }
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Create the table with the expected layout, or verify the existing one
    pub async fn ensure_table(&self, kind: Kind, stage: Stage) -> Result<String, LoadError> {
        let table = table_name(kind, stage);
        let expected = TableLayout::for_target(kind, stage);

        let found = match self.warehouse.table_layout(&table).await? {
            Some(found) => found,
            None => {
                self.warehouse.create_table(&table, &expected).await?;
                self.warehouse
                    .table_layout(&table)
                    .await?
                    .unwrap_or_else(|| expected.clone())
            },
        };

        if found != expected {
            return Err(LoadError::LayoutConflict {
                table,
                expected,
                found,
            });
        }
        Ok(table)
    }

    /// Load a landed object into its target table
    #[instrument(skip(self, object), fields(key = %object.key))]
    pub async fn load(
        &self,
        object: &LandedObject,
        kind: Kind,
        stage: Stage,
    ) -> Result<LoadReceipt, LoadError> {
        let table = self.ensure_table(kind, stage).await?;

        let data = self
            .store
            .get(&object.key)
            .await
            .map_err(|source| LoadError::Store {
                key: object.key.clone(),
                source,
            })?
            .ok_or_else(|| LoadError::MissingObject(object.key.clone()))?;

        verify_checksum(&data, &object.checksum).map_err(|source| LoadError::Integrity {
            key: object.key.clone(),
            source,
        })?;

        let rows = decode_batch(&object.key, &data)?;
        let row_count = rows.len() as u64;
        let job_id = load_job_id(&object.key);

        let disposition = self
            .warehouse
            .submit_load(LoadJob {
                job_id: job_id.clone(),
                table: table.clone(),
                source_object: object.key.clone(),
                checksum: object.checksum.clone(),
                rows,
            })
            .await?;

        info!(table = %table, job_id = %job_id, rows = row_count, disposition = ?disposition, "Load committed");

        Ok(LoadReceipt {
            job_id,
            table,
            rows: row_count,
            disposition,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::landing::LandingWriter;
    use crate::records::MalformedPolicy;
    use crate::storage::LocalStore;
    use epc_common::types::PartitionKey;
    use serde_json::json;

    #[test]
    fn test_table_names() {
        assert_eq!(table_name(Kind::Domestic, Stage::Certs), "domestic_raw_json");
        assert_eq!(table_name(Kind::NonDomestic, Stage::Certs), "non_domestic_raw_json");
        assert_eq!(
            table_name(Kind::NonDomestic, Stage::Recs),
            "non_domestic_recommendations_raw_json"
        );
    }

    #[test]
    fn test_layouts() {
        let domestic = TableLayout::for_target(Kind::Domestic, Stage::Certs);
        assert_eq!(domestic.partition_column, "lodgement_date");
        assert_eq!(domestic.clustering, ["lmk_key", "postcode", "uprn"]);
        assert_eq!(
            TableLayout::for_target(Kind::Domestic, Stage::Recs).clustering,
            ["lmk_key"]
        );
    }

    #[test]
    fn test_job_id_is_deterministic() {
        let a = load_job_id("landing/domestic/2024-01/certs/part-0001.ndjson.gz");
        let b = load_job_id("landing/domestic/2024-01/certs/part-0001.ndjson.gz");
        let c = load_job_id("landing/domestic/2024-02/certs/part-0001.ndjson.gz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("epc_load_"));
    }

    async fn landed(
        store: Arc<dyn ObjectStore>,
        rows: Vec<serde_json::Value>,
    ) -> LandedObject {
        let writer = LandingWriter::new(store, MalformedPolicy::Fail);
        let partition = PartitionKey::month(Kind::Domestic, "2024-01".parse().unwrap());
        let mut batch = writer.begin(&partition, Stage::Certs).unwrap();
        batch.push_rows(rows).unwrap();
        batch.finish().await.unwrap().object.unwrap()
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = WarehouseLoader::new(warehouse.clone(), store.clone());

        let object = landed(store.clone(), vec![json!({"lmk-key": "a"}), json!({"lmk-key": "b"})]).await;

        let first = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap();
        let second = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap();

        assert_eq!(first.disposition, LoadDisposition::Loaded);
        assert_eq!(second.disposition, LoadDisposition::AlreadyLoaded);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(warehouse.row_count("domestic_raw_json"), 2);
    }

    #[tokio::test]
    async fn test_changed_content_replaces_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = WarehouseLoader::new(warehouse.clone(), store.clone());

        let object = landed(store.clone(), vec![json!({"lmk-key": "a"})]).await;
        loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap();

        let redo = landed(store.clone(), vec![json!({"lmk-key": "a"}), json!({"lmk-key": "z"})]).await;
        let receipt = loader.load(&redo, Kind::Domestic, Stage::Certs).await.unwrap();

        assert_eq!(receipt.disposition, LoadDisposition::Replaced);
        assert_eq!(warehouse.row_count("domestic_raw_json"), 2);
    }

    #[tokio::test]
    async fn test_layout_conflict_is_not_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let warehouse = Arc::new(MemoryWarehouse::new());
        let wrong = TableLayout {
            partition_column: "lodgement_date".to_string(),
            clustering: vec!["uprn".to_string()],
        };
        warehouse.create_table("domestic_raw_json", &wrong).await.unwrap();

        let loader = WarehouseLoader::new(warehouse.clone(), store.clone());
        let object = landed(store.clone(), vec![json!({"lmk-key": "a"})]).await;
        let err = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap_err();

        assert!(matches!(err, LoadError::LayoutConflict { .. }));
        assert_eq!(warehouse.table_layout("domestic_raw_json").await.unwrap(), Some(wrong));
        assert_eq!(warehouse.row_count("domestic_raw_json"), 0);
    }

    #[tokio::test]
    async fn test_tampered_object_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let loader = WarehouseLoader::new(Arc::new(MemoryWarehouse::new()), store.clone());

        let mut object = landed(store.clone(), vec![json!({"lmk-key": "a"})]).await;
        object.checksum = "0".repeat(64);
        let err = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap_err();
        assert!(matches!(err, LoadError::Integrity { .. }));
    }
}
