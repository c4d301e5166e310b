//! Partitioned ingestion runs
//!
//! A run expands its request into work units, one per partition, and drives
//! them with bounded concurrency. Stages inside a unit run in order; units
//! never wait on each other. Every stage is checkpoint-gated: a stage with a
//! marker is skipped, a stage without one is fetched, landed, loaded and only
//! then marked. A failure stays inside its unit and is reported in the
//! [`RunSummary`] instead of aborting the run.

use anyhow::{Context, Result};
use chrono::Utc;
use epc_common::types::{Kind, Month, PartitionKey, Period, PeriodRange, Stage};
use epc_common::EpcError;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::{
    CheckpointDocument, CheckpointError, CheckpointMeta, CheckpointStatus, CheckpointStore,
};
use crate::client::EpcClient;
use crate::config::DEFAULT_CONCURRENCY;
use crate::landing::{LandingReceipt, LandingWriter};
use crate::recommendations::{stream_archive, ArchiveFetcher, ArchiveSource};
use crate::records::with_certificate_key;
use crate::warehouse::WarehouseLoader;

pub mod summary;

pub use summary::{
    ErrorKind, NotRunReason, OutcomeCounts, RunSummary, StageError, StageOutcome, StageReport,
};

/// Month-range ingestion
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub kinds: Vec<Kind>,
    pub start: Month,
    pub end: Month,
    /// Also fetch recommendations for each month's certificates
    pub with_recs: bool,
    pub dry_run: bool,
    /// Clear this stage's checkpoints over the range before running
    pub reset: Option<Stage>,
}

/// What a recommendations backfill covers
#[derive(Debug, Clone)]
pub enum BackfillTarget {
    /// A full year from a bulk archive
    Year { year: u16, source: ArchiveSource },
    /// Individual certificates through the API
    Certificates(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub kind: Kind,
    pub target: BackfillTarget,
    pub dry_run: bool,
}

/// One partition and the stages to drive for it, in order
#[derive(Debug, Clone)]
struct WorkUnit {
    partition: PartitionKey,
    stages: Vec<Stage>,
    archive: Option<ArchiveSource>,
}

pub struct Orchestrator {
    client: EpcClient,
    checkpoints: CheckpointStore,
    landing: LandingWriter,
    loader: Option<WarehouseLoader>,
    archives: ArchiveFetcher,
    concurrency: usize,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator without a warehouse; only dry runs work until
    /// [`Self::with_loader`] is called
    pub fn new(
        client: EpcClient,
        checkpoints: CheckpointStore,
        landing: LandingWriter,
        archives: ArchiveFetcher,
    ) -> Self {
        Self {
            client,
            checkpoints,
            landing,
            loader: None,
            archives,
            concurrency: DEFAULT_CONCURRENCY,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_loader(mut self, loader: WarehouseLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Stop starting new stages once `deadline` has elapsed since the run began
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Ingest every selected kind over a month range
    #[instrument(skip(self, request), fields(start = %request.start, end = %request.end, dry_run = request.dry_run))]
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let months = Month::range_inclusive(request.start, request.end)?;
        let kinds = distinct_kinds(&request.kinds)?;

        if !request.dry_run {
            self.prepare_warehouse().await?;
        }

        if let Some(stage) = request.reset {
            let range = PeriodRange::months(request.start, request.end)?;
            if request.dry_run {
                info!(stage = %stage, "Dry run: leaving checkpoints in place");
            } else {
                let cleared = self.reset(&kinds, &range, &[stage]).await?;
                info!(stage = %stage, cleared = cleared.len(), "Reset checkpoints before run");
            }
        }

        let stages = if request.with_recs {
            vec![Stage::Certs, Stage::Recs]
        } else {
            vec![Stage::Certs]
        };

        let units: Vec<WorkUnit> = kinds
            .iter()
            .flat_map(|kind| {
                let stages = stages.clone();
                months.iter().map(move |month| WorkUnit {
                    partition: PartitionKey::month(*kind, *month),
                    stages: stages.clone(),
                    archive: None,
                })
            })
            .collect();

        Ok(self.execute(run_id, started_at, units, request.dry_run).await)
    }

    /// Ingest recommendations for a year archive or a list of certificates
    #[instrument(skip(self, request), fields(kind = %request.kind, dry_run = request.dry_run))]
    pub async fn backfill(&self, request: BackfillRequest) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let units = match request.target {
            BackfillTarget::Year { year, source } => vec![WorkUnit {
                partition: PartitionKey::new(request.kind, Period::Year(year)),
                stages: vec![Stage::Recs],
                archive: Some(source),
            }],
            BackfillTarget::Certificates(keys) => {
                let mut seen = HashSet::new();
                let mut units = Vec::new();
                for key in keys {
                    let key = key.trim().to_string();
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                    units.push(WorkUnit {
                        partition: PartitionKey::new(request.kind, Period::certificate(key)?),
                        stages: vec![Stage::Recs],
                        archive: None,
                    });
                }
                if units.is_empty() {
                    anyhow::bail!("At least one certificate key is required");
                }
                units
            },
        };

        if !request.dry_run {
            self.prepare_warehouse().await?;
        }

        Ok(self.execute(run_id, started_at, units, request.dry_run).await)
    }

    /// Delete checkpoints in `range` for the given kinds and stages
    pub async fn reset(
        &self,
        kinds: &[Kind],
        range: &PeriodRange,
        stages: &[Stage],
    ) -> Result<Vec<String>, CheckpointError> {
        let mut cleared = Vec::new();
        for kind in kinds {
            cleared.extend(self.checkpoints.clear(*kind, range, stages).await?);
        }
        Ok(cleared)
    }

    /// Checkpoints present in `range`
    pub async fn status(
        &self,
        kinds: &[Kind],
        range: &PeriodRange,
    ) -> Result<Vec<CheckpointDocument>, CheckpointError> {
        let mut docs = Vec::new();
        for kind in kinds {
            docs.extend(self.checkpoints.list(*kind, range).await?);
        }
        Ok(docs)
    }

    async fn prepare_warehouse(&self) -> Result<()> {
        let loader = self
            .loader
            .as_ref()
            .context("A warehouse connection is required unless running dry")?;
        loader
            .warehouse()
            .ensure_schema()
            .await
            .context("Failed to prepare warehouse schema")?;
        Ok(())
    }

    async fn execute(
        &self,
        run_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        units: Vec<WorkUnit>,
        dry_run: bool,
    ) -> RunSummary {
        let deadline = self.deadline.map(|d| Instant::now() + d);
        let partitions = units.len();

        info!(
            run_id = %run_id,
            partitions,
            concurrency = self.concurrency,
            dry_run,
            "Starting ingestion run"
        );

        let reports: Vec<Vec<StageReport>> = stream::iter(units)
            .map(|unit| self.run_unit(unit, dry_run, deadline))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let summary = RunSummary::new(
            run_id,
            dry_run,
            started_at,
            partitions,
            reports.into_iter().flatten().collect(),
        );

        info!(
            run_id = %run_id,
            checkpointed = summary.counts.checkpointed,
            no_data = summary.counts.no_data,
            already_done = summary.counts.already_done,
            failed = summary.counts.failed,
            not_run = summary.counts.not_run,
            records = summary.records_landed,
            duration_seconds = summary.duration_seconds,
            "Ingestion run finished"
        );

        summary
    }

    fn interruption(&self, deadline: Option<Instant>) -> Option<NotRunReason> {
        if self.cancel.is_cancelled() {
            Some(NotRunReason::Cancelled)
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some(NotRunReason::DeadlineExceeded)
        } else {
            None
        }
    }

    #[instrument(skip(self, unit, deadline), fields(kind = %unit.partition.kind, period = %unit.partition.period))]
    async fn run_unit(
        &self,
        unit: WorkUnit,
        dry_run: bool,
        deadline: Option<Instant>,
    ) -> Vec<StageReport> {
        let mut reports = Vec::with_capacity(unit.stages.len());
        let mut prior_failed = false;

        for &stage in &unit.stages {
            let started = Instant::now();

            let blocked = if prior_failed {
                Some(NotRunReason::PriorStageFailed)
            } else {
                self.interruption(deadline)
            };

            let outcome = match blocked {
                Some(reason) => {
                    debug!(stage = %stage, reason = ?reason, "Stage not run");
                    StageOutcome::NotRun { reason }
                },
                None => match self.run_stage(&unit, stage, dry_run).await {
                    Ok(outcome) => {
                        info!(
                            stage = %stage,
                            duration_seconds = started.elapsed().as_secs_f64(),
                            "Completed stage: {:?}",
                            outcome
                        );
                        outcome
                    },
                    Err(e) => {
                        error!(stage = %stage, error_kind = ?e.kind(), "Failed stage: {}", e);
                        StageOutcome::failed(&e)
                    },
                },
            };

            prior_failed = outcome.is_failed();
            reports.push(StageReport {
                kind: unit.partition.kind,
                period: unit.partition.period.clone(),
                stage,
                outcome,
                duration_seconds: started.elapsed().as_secs_f64(),
            });
        }

        reports
    }

    async fn run_stage(
        &self,
        unit: &WorkUnit,
        stage: Stage,
        dry_run: bool,
    ) -> Result<StageOutcome, StageError> {
        let partition = &unit.partition;
        partition.check_stage(stage)?;

        if let Some(doc) = self.checkpoints.load(partition, stage).await? {
            debug!(stage = %stage, status = doc.status.as_str(), "Checkpoint present, skipping");
            return Ok(StageOutcome::AlreadyDone { status: doc.status });
        }

        if dry_run {
            return Ok(StageOutcome::Planned);
        }

        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| StageError::Precondition("no warehouse configured".to_string()))?;

        let receipt = match (stage, &partition.period) {
            (Stage::Certs, Period::Month(month)) => self.land_certificates(partition, *month).await?,
            (Stage::Recs, Period::Month(_)) => {
                let keys = self.landed_certificate_keys(partition).await?;
                self.land_recommendations(partition, keys).await?
            },
            (Stage::Recs, Period::Certificate(key)) => {
                self.land_recommendations(partition, vec![key.clone()]).await?
            },
            (Stage::Recs, Period::Year(_)) => {
                let source = unit.archive.as_ref().ok_or_else(|| {
                    StageError::Precondition(format!(
                        "no recommendations archive configured for {}",
                        partition
                    ))
                })?;
                self.land_archive(partition, source).await?
            },
            (Stage::Certs, Period::Year(_) | Period::Certificate(_)) => {
                return Err(EpcError::StagePeriodMismatch {
                    stage: stage.to_string(),
                    period: partition.period.to_string(),
                }
                .into());
            },
        };

        let Some(object) = receipt.object else {
            self.checkpoints
                .mark_done(
                    partition,
                    stage,
                    CheckpointStatus::NoData,
                    CheckpointMeta {
                        records: 0,
                        skipped: receipt.skipped,
                        duplicates: receipt.duplicates,
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(StageOutcome::NoData {
                skipped: receipt.skipped,
            });
        };

        let load = loader.load(&object, partition.kind, stage).await?;

        self.checkpoints
            .mark_done(
                partition,
                stage,
                CheckpointStatus::Done,
                CheckpointMeta {
                    records: object.records,
                    skipped: receipt.skipped,
                    duplicates: receipt.duplicates,
                    object_key: Some(object.key.clone()),
                    checksum: Some(object.checksum.clone()),
                    load_job_id: Some(load.job_id.clone()),
                },
            )
            .await?;

        Ok(StageOutcome::Checkpointed {
            records: object.records,
            skipped: receipt.skipped,
            duplicates: receipt.duplicates,
            object_key: object.key,
            table: load.table,
            load_job_id: load.job_id,
            disposition: load.disposition,
        })
    }

    async fn land_certificates(
        &self,
        partition: &PartitionKey,
        month: Month,
    ) -> Result<LandingReceipt, StageError> {
        let mut batch = self.landing.begin(partition, Stage::Certs)?;
        let mut pages = self.client.search(partition.kind, month);

        while let Some(page) = pages.next_page().await? {
            let rows = page.rows.len();
            let kept = batch.push_rows(page.rows)?;
            debug!(page = page.number, rows, kept, "Fetched certificate page");
        }

        Ok(batch.finish().await?)
    }

    /// Certificate keys from this month's landed certificates
    ///
    /// A month whose certificates were `no-data` has no keys. Certificates
    /// that were never checkpointed are a precondition failure.
    async fn landed_certificate_keys(
        &self,
        partition: &PartitionKey,
    ) -> Result<Vec<String>, StageError> {
        let doc = self
            .checkpoints
            .load(partition, Stage::Certs)
            .await?
            .ok_or_else(|| {
                StageError::Precondition(format!(
                    "certificates for {} have not been ingested",
                    partition
                ))
            })?;

        if doc.status == CheckpointStatus::NoData {
            return Ok(Vec::new());
        }

        let key = doc
            .meta
            .object_key
            .unwrap_or_else(|| self.landing.key_for(partition, Stage::Certs));
        let records = self.landing.read(&key).await?.ok_or_else(|| {
            StageError::Precondition(format!("landed certificates {} are missing", key))
        })?;

        let mut seen = HashSet::new();
        Ok(records
            .into_iter()
            .map(|r| r.lmk_key)
            .filter(|k| seen.insert(k.clone()))
            .collect())
    }

    async fn land_recommendations(
        &self,
        partition: &PartitionKey,
        keys: Vec<String>,
    ) -> Result<LandingReceipt, StageError> {
        let mut batch = self.landing.begin(partition, Stage::Recs)?;
        let total = keys.len();

        for (index, lmk_key) in keys.into_iter().enumerate() {
            let rows = self.client.recommendations(partition.kind, &lmk_key).await?;
            let rows = rows
                .into_iter()
                .map(|row| with_certificate_key(row, &lmk_key))
                .collect();
            batch.push_rows(rows)?;

            if (index + 1) % 500 == 0 {
                debug!(done = index + 1, total, "Recommendation fetch progress");
            }
        }

        Ok(batch.finish().await?)
    }

    async fn land_archive(
        &self,
        partition: &PartitionKey,
        source: &ArchiveSource,
    ) -> Result<LandingReceipt, StageError> {
        let mut rows = stream_archive(&self.archives, source).await?;
        let mut batch = self.landing.begin(partition, Stage::Recs)?;

        while let Some(chunk) = rows.next_chunk().await {
            batch.push_rows(chunk)?;
            debug!(records = batch.records(), "Landed archive chunk");
        }

        let total = rows.finish().await?;
        if total == 0 {
            warn!(source = %source, "Archive contained no rows");
        }
        Ok(batch.finish().await?)
    }
}

fn distinct_kinds(kinds: &[Kind]) -> Result<Vec<Kind>> {
    let mut kinds = kinds.to_vec();
    kinds.sort();
    kinds.dedup();
    if kinds.is_empty() {
        anyhow::bail!("At least one kind must be selected");
    }
    Ok(kinds)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_kinds() {
        assert_eq!(
            distinct_kinds(&[Kind::NonDomestic, Kind::Domestic, Kind::NonDomestic]).unwrap(),
            vec![Kind::Domestic, Kind::NonDomestic]
        );
        assert!(distinct_kinds(&[]).is_err());
    }
}
