//! In-process warehouse
//!
//! Keeps tables and the job ledger in memory with the same job semantics as
//! the Postgres backend. Used by tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{LoadDisposition, LoadError, LoadJob, TableLayout, Warehouse};
use crate::records::Record;

#[derive(Debug, Clone)]
struct StoredRow {
    job_id: String,
    record: Record,
}

#[derive(Debug, Clone)]
struct JobEntry {
    checksum: String,
}

#[derive(Debug, Default)]
struct State {
    layouts: HashMap<String, TableLayout>,
    rows: HashMap<String, Vec<StoredRow>>,
    jobs: HashMap<String, JobEntry>,
    submissions: usize,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.with_state(|s| s.rows.get(table).map(Vec::len).unwrap_or(0))
    }

    /// Record ids currently in `table`, sorted
    pub fn record_ids(&self, table: &str) -> Vec<String> {
        self.with_state(|s| {
            let mut ids: Vec<String> = s
                .rows
                .get(table)
                .map(|rows| rows.iter().map(|r| r.record.record_id.clone()).collect())
                .unwrap_or_default();
            ids.sort();
            ids
        })
    }

    /// Number of `submit_load` calls, including no-op ones
    pub fn submissions(&self) -> usize {
        self.with_state(|s| s.submissions)
    }

    pub fn committed_jobs(&self) -> usize {
        self.with_state(|s| s.jobs.len())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_schema(&self) -> Result<(), LoadError> {
        Ok(())
    }

    async fn table_layout(&self, table: &str) -> Result<Option<TableLayout>, LoadError> {
        Ok(self.with_state(|s| s.layouts.get(table).cloned()))
    }

    async fn create_table(&self, table: &str, layout: &TableLayout) -> Result<(), LoadError> {
        self.with_state(|s| {
            s.layouts
                .entry(table.to_string())
                .or_insert_with(|| layout.clone());
            s.rows.entry(table.to_string()).or_default();
        });
        Ok(())
    }

    async fn submit_load(&self, job: LoadJob) -> Result<LoadDisposition, LoadError> {
        Ok(self.with_state(|s| {
            s.submissions += 1;

            let disposition = match s.jobs.get(&job.job_id) {
                Some(entry) if entry.checksum == job.checksum => return LoadDisposition::AlreadyLoaded,
                Some(_) => LoadDisposition::Replaced,
                None => LoadDisposition::Loaded,
            };

            let rows = s.rows.entry(job.table.clone()).or_default();
            rows.retain(|r| r.job_id != job.job_id);
            rows.extend(job.rows.into_iter().map(|record| StoredRow {
                job_id: job.job_id.clone(),
                record,
            }));
            s.jobs.insert(
                job.job_id.clone(),
                JobEntry {
                    checksum: job.checksum,
                },
            );
            disposition
        }))
    }
}
