//! PostgreSQL warehouse backend
//!
//! Each target table lives in the configured schema next to two bookkeeping
//! tables: `warehouse_table_layouts` (layout fixed at creation) and
//! `warehouse_load_jobs` (one row per committed load job). A load job runs in
//! a single transaction, so either all of its rows and its ledger entry are
//! visible or none are.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{LoadDisposition, LoadError, LoadJob, TableLayout, Warehouse};
use crate::config::WarehouseConfig;

const LAYOUTS_TABLE: &str = "warehouse_table_layouts";
const JOBS_TABLE: &str = "warehouse_load_jobs";

/// Rows per INSERT statement; 8 binds per row stays under the protocol limit
const INSERT_CHUNK_ROWS: usize = 1000;

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
    schema: String,
}

impl PostgresWarehouse {
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, LoadError> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            LoadError::Database(sqlx::Error::Configuration("DATABASE_URL is not set".into()))
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;

        info!(schema = %config.schema, "Connected to warehouse");
        Ok(Self::from_pool(pool, config.schema.clone()))
    }

    pub fn from_pool(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", ident(&self.schema), ident(table))
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    async fn ensure_schema(&self) -> Result<(), LoadError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", ident(&self.schema)))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                table_name TEXT PRIMARY KEY,
                partition_column TEXT NOT NULL,
                clustering_columns TEXT[] NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.qualified(LAYOUTS_TABLE)
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                job_id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                source_object TEXT NOT NULL,
                checksum TEXT NOT NULL,
                row_count BIGINT NOT NULL,
                loaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            self.qualified(JOBS_TABLE)
        ))
        .execute(&self.pool)
        .await?;

        debug!(schema = %self.schema, "Warehouse schema ready");
        Ok(())
    }

    async fn table_layout(&self, table: &str) -> Result<Option<TableLayout>, LoadError> {
        let row: Option<(String, Vec<String>)> = sqlx::query_as(&format!(
            "SELECT partition_column, clustering_columns FROM {} WHERE table_name = $1",
            self.qualified(LAYOUTS_TABLE)
        ))
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(partition_column, clustering)| TableLayout {
            partition_column,
            clustering,
        }))
    }

    #[instrument(skip(self, layout))]
    async fn create_table(&self, table: &str, layout: &TableLayout) -> Result<(), LoadError> {
        let qualified = self.qualified(table);
        let mut tx = self.pool.begin().await?;

        // Concurrent first loads into one table serialize here; released at commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&qualified)
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                record_id TEXT NOT NULL,
                lmk_key TEXT NOT NULL,
                lodgement_date DATE,
                postcode TEXT,
                uprn TEXT,
                payload JSONB NOT NULL,
                source_object TEXT NOT NULL,
                load_job_id TEXT NOT NULL,
                loaded_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
            qualified
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            ident(&format!("{}_partition_idx", table)),
            qualified,
            ident(&layout.partition_column)
        ))
        .execute(&mut *tx)
        .await?;

        if !layout.clustering.is_empty() {
            let columns: Vec<String> = layout.clustering.iter().map(|c| ident(c)).collect();
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                ident(&format!("{}_cluster_idx", table)),
                qualified,
                columns.join(", ")
            ))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (load_job_id)",
            ident(&format!("{}_job_idx", table)),
            qualified
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO {} (table_name, partition_column, clustering_columns)
             VALUES ($1, $2, $3)
             ON CONFLICT (table_name) DO NOTHING",
            self.qualified(LAYOUTS_TABLE)
        ))
        .bind(table)
        .bind(&layout.partition_column)
        .bind(&layout.clustering)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(table, layout = %layout, "Created warehouse table");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id, table = %job.table, rows = job.rows.len()))]
    async fn submit_load(&self, job: LoadJob) -> Result<LoadDisposition, LoadError> {
        let qualified = self.qualified(&job.table);
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT checksum FROM {} WHERE job_id = $1 FOR UPDATE",
            self.qualified(JOBS_TABLE)
        ))
        .bind(&job.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let disposition = match existing {
            Some((checksum,)) if checksum == job.checksum => {
                tx.rollback().await?;
                return Ok(LoadDisposition::AlreadyLoaded);
            },
            Some(_) => {
                sqlx::query(&format!("DELETE FROM {} WHERE load_job_id = $1", qualified))
                    .bind(&job.job_id)
                    .execute(&mut *tx)
                    .await?;
                LoadDisposition::Replaced
            },
            None => LoadDisposition::Loaded,
        };

        for chunk in job.rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (record_id, lmk_key, lodgement_date, postcode, uprn, payload, source_object, load_job_id) ",
                qualified
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(&record.record_id)
                    .push_bind(&record.lmk_key)
                    .push_bind(record.lodgement_date)
                    .push_bind(&record.postcode)
                    .push_bind(&record.uprn)
                    .push_bind(&record.payload)
                    .push_bind(&job.source_object)
                    .push_bind(&job.job_id);
            });
            builder.build().execute(&mut *tx).await?;
        }

        sqlx::query(&format!(
            "INSERT INTO {} (job_id, table_name, source_object, checksum, row_count)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (job_id) DO UPDATE
             SET checksum = EXCLUDED.checksum,
                 row_count = EXCLUDED.row_count,
                 loaded_at = now()",
            self.qualified(JOBS_TABLE)
        ))
        .bind(&job.job_id)
        .bind(&job.table)
        .bind(&job.source_object)
        .bind(&job.checksum)
        .bind(job.rows.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident_quoting() {
        assert_eq!(ident("domestic_raw_json"), "\"domestic_raw_json\"");
        assert_eq!(ident("we\"ird"), "\"we\"\"ird\"");
    }
}
