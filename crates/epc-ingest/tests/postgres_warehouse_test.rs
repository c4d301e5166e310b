//! PostgreSQL warehouse tests using testcontainers
//!
//! **Requirements**: Docker must be running.
//!
//! ```bash
//! cargo test --test postgres_warehouse_test -- --ignored
//! ```

use epc_common::types::{Kind, PartitionKey, Stage};
use epc_ingest::landing::{LandedObject, LandingWriter};
use epc_ingest::records::MalformedPolicy;
use epc_ingest::storage::{LocalStore, ObjectStore};
use epc_ingest::warehouse::{
    LoadDisposition, LoadError, PostgresWarehouse, TableLayout, Warehouse, WarehouseLoader,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

const SCHEMA: &str = "epc_raw";

async fn start_postgres() -> (ContainerAsync<Postgres>, PgPool) {
    let container = Postgres::default()
        .with_tag("16-alpine")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get container host");
    let port = container
        .get_host_port_ipv4(5432.tcp())
        .await
        .expect("Failed to get container port");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&format!("postgresql://postgres:postgres@{}:{}/postgres", host, port))
        .await
        .expect("Failed to connect to PostgreSQL");

    (container, pool)
}

async fn land(store: Arc<dyn ObjectStore>, rows: Vec<Value>) -> LandedObject {
    let writer = LandingWriter::new(store, MalformedPolicy::Fail);
    let partition = PartitionKey::month(Kind::Domestic, "2024-01".parse().unwrap());
    let mut batch = writer.begin(&partition, Stage::Certs).unwrap();
    batch.push_rows(rows).unwrap();
    batch.finish().await.unwrap().object.unwrap()
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}.{}", SCHEMA, table))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_postgres_load_is_idempotent() {
    let (_container, pool) = start_postgres().await;
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());

    let warehouse = Arc::new(PostgresWarehouse::from_pool(pool.clone(), SCHEMA));
    warehouse.ensure_schema().await.unwrap();
    let loader = WarehouseLoader::new(warehouse.clone(), store.clone());

    let object = land(
        store.clone(),
        vec![
            json!({"lmk-key": "a", "lodgement-date": "2024-01-02", "postcode": "SW1A 1AA"}),
            json!({"lmk-key": "b", "lodgement-date": "2024-01-03"}),
        ],
    )
    .await;

    let first = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap();
    assert_eq!(first.disposition, LoadDisposition::Loaded);
    assert_eq!(count(&pool, "domestic_raw_json").await, 2);

    let second = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap();
    assert_eq!(second.disposition, LoadDisposition::AlreadyLoaded);
    assert_eq!(count(&pool, "domestic_raw_json").await, 2);

    // Same key, new content: the job's rows are replaced
    let redo = land(
        store.clone(),
        vec![
            json!({"lmk-key": "a"}),
            json!({"lmk-key": "b"}),
            json!({"lmk-key": "c"}),
        ],
    )
    .await;
    let third = loader.load(&redo, Kind::Domestic, Stage::Certs).await.unwrap();
    assert_eq!(third.disposition, LoadDisposition::Replaced);
    assert_eq!(count(&pool, "domestic_raw_json").await, 3);

    let jobs: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {}.warehouse_load_jobs",
        SCHEMA
    ))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(jobs, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_postgres_layout_is_fixed_at_creation() {
    let (_container, pool) = start_postgres().await;
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());

    let warehouse = Arc::new(PostgresWarehouse::from_pool(pool.clone(), SCHEMA));
    warehouse.ensure_schema().await.unwrap();

    let wrong = TableLayout {
        partition_column: "lodgement_date".to_string(),
        clustering: vec!["uprn".to_string()],
    };
    warehouse.create_table("domestic_raw_json", &wrong).await.unwrap();

    let loader = WarehouseLoader::new(warehouse.clone(), store.clone());
    let object = land(store.clone(), vec![json!({"lmk-key": "a"})]).await;
    let err = loader.load(&object, Kind::Domestic, Stage::Certs).await.unwrap_err();

    assert!(matches!(err, LoadError::LayoutConflict { .. }));
    assert_eq!(
        warehouse.table_layout("domestic_raw_json").await.unwrap(),
        Some(wrong)
    );
    assert_eq!(count(&pool, "domestic_raw_json").await, 0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_postgres_concurrent_first_loads_share_table() {
    let (_container, pool) = start_postgres().await;
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());

    let warehouse = Arc::new(PostgresWarehouse::from_pool(pool.clone(), SCHEMA));
    warehouse.ensure_schema().await.unwrap();
    let loader = WarehouseLoader::new(warehouse.clone(), store.clone());

    let writer = LandingWriter::new(store.clone(), MalformedPolicy::Fail);
    let mut objects = Vec::new();
    for month in ["2024-01", "2024-02", "2024-03", "2024-04"] {
        let partition = PartitionKey::month(Kind::Domestic, month.parse().unwrap());
        let mut batch = writer.begin(&partition, Stage::Certs).unwrap();
        batch
            .push_rows(vec![json!({"lmk-key": format!("cert-{}", month)})])
            .unwrap();
        objects.push(batch.finish().await.unwrap().object.unwrap());
    }

    let loads = futures::future::join_all(
        objects
            .iter()
            .map(|object| loader.load(object, Kind::Domestic, Stage::Certs)),
    )
    .await;

    for load in loads {
        assert_eq!(load.unwrap().disposition, LoadDisposition::Loaded);
    }
    assert_eq!(count(&pool, "domestic_raw_json").await, 4);
    assert_eq!(
        warehouse.table_layout("domestic_raw_json").await.unwrap(),
        Some(TableLayout::for_target(Kind::Domestic, Stage::Certs))
    );
}
