//! Per-stage outcomes and the machine-readable run summary

use chrono::{DateTime, Utc};
use epc_common::types::{Kind, Period, Stage};
use epc_common::EpcError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointStatus};
use crate::client::FetchError;
use crate::landing::LandingError;
use crate::recommendations::ArchiveError;
use crate::warehouse::{LoadDisposition, LoadError};

/// Failure classes reported in the summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TransientFetch,
    TerminalFetch,
    FetchExhausted,
    MalformedRecord,
    LayoutConflict,
    CheckpointIo,
    Storage,
    Load,
    Archive,
    Precondition,
}

/// Why a single stage failed
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Landing(#[from] LandingError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    InvalidStage(#[from] EpcError),

    #[error("{0}")]
    Precondition(String),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Fetch(FetchError::Transient { .. }) => ErrorKind::TransientFetch,
            StageError::Fetch(FetchError::Terminal { .. }) => ErrorKind::TerminalFetch,
            StageError::Fetch(FetchError::Exhausted { .. }) => ErrorKind::FetchExhausted,
            StageError::Landing(LandingError::MalformedRecord(_)) => ErrorKind::MalformedRecord,
            StageError::Landing(_) => ErrorKind::Storage,
            StageError::Load(LoadError::LayoutConflict { .. }) => ErrorKind::LayoutConflict,
            StageError::Load(LoadError::Store { .. } | LoadError::MissingObject(_)) => {
                ErrorKind::Storage
            },
            StageError::Load(_) => ErrorKind::Load,
            StageError::Checkpoint(_) => ErrorKind::CheckpointIo,
            StageError::Archive(ArchiveError::Download(FetchError::Exhausted { .. })) => {
                ErrorKind::FetchExhausted
            },
            StageError::Archive(_) => ErrorKind::Archive,
            StageError::InvalidStage(_) | StageError::Precondition(_) => ErrorKind::Precondition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotRunReason {
    Cancelled,
    DeadlineExceeded,
    /// An earlier stage of the same partition failed
    PriorStageFailed,
}

/// Terminal state of one (partition, stage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum StageOutcome {
    /// Landed, loaded and checkpointed by this run
    Checkpointed {
        records: u64,
        skipped: u64,
        duplicates: u64,
        object_key: String,
        table: String,
        load_job_id: String,
        disposition: LoadDisposition,
    },
    /// Source had nothing; checkpointed as `no-data`
    NoData { skipped: u64 },
    /// Skipped because a checkpoint already existed
    AlreadyDone { status: CheckpointStatus },
    /// Dry run: would have run
    Planned,
    Failed { error_kind: ErrorKind, cause: String },
    NotRun { reason: NotRunReason },
}

impl StageOutcome {
    pub fn failed(err: &StageError) -> Self {
        StageOutcome::Failed {
            error_kind: err.kind(),
            cause: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub kind: Kind,
    pub period: Period,
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub checkpointed: usize,
    pub no_data: usize,
    pub already_done: usize,
    pub planned: usize,
    pub failed: usize,
    pub not_run: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub partitions: usize,
    pub records_landed: u64,
    pub counts: OutcomeCounts,
    /// Sorted by kind, period, stage
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    pub fn new(
        run_id: Uuid,
        dry_run: bool,
        started_at: DateTime<Utc>,
        partitions: usize,
        mut stages: Vec<StageReport>,
    ) -> Self {
        stages.sort_by(|a, b| {
            (a.kind, &a.period, a.stage).cmp(&(b.kind, &b.period, b.stage))
        });

        let mut counts = OutcomeCounts::default();
        let mut records_landed = 0;
        for report in &stages {
            match &report.outcome {
                StageOutcome::Checkpointed { records, .. } => {
                    counts.checkpointed += 1;
                    records_landed += records;
                },
                StageOutcome::NoData { .. } => counts.no_data += 1,
                StageOutcome::AlreadyDone { .. } => counts.already_done += 1,
                StageOutcome::Planned => counts.planned += 1,
                StageOutcome::Failed { .. } => counts.failed += 1,
                StageOutcome::NotRun { .. } => counts.not_run += 1,
            }
        }

        let finished_at = Utc::now();
        let duration_seconds = (finished_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            run_id,
            dry_run,
            started_at,
            finished_at,
            duration_seconds,
            partitions,
            records_landed,
            counts,
            stages,
        }
    }

    /// True when the run stopped early from cancellation or its deadline
    pub fn interrupted(&self) -> bool {
        self.stages.iter().any(|s| {
            matches!(
                s.outcome,
                StageOutcome::NotRun {
                    reason: NotRunReason::Cancelled | NotRunReason::DeadlineExceeded
                }
            )
        })
    }

    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }

    /// Process exit code: 1 on any failure, 2 if interrupted, else 0
    pub fn exit_code(&self) -> u8 {
        if self.has_failures() {
            1
        } else if self.interrupted() {
            2
        } else {
            0
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StageReport> {
        self.stages.iter().filter(|s| s.outcome.is_failed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn report(period: &str, stage: Stage, outcome: StageOutcome) -> StageReport {
        StageReport {
            kind: Kind::Domestic,
            period: period.parse().unwrap(),
            stage,
            outcome,
            duration_seconds: 0.0,
        }
    }

    #[test]
    fn test_error_kinds() {
        let exhausted = StageError::Fetch(FetchError::Exhausted {
            attempts: 5,
            last: Box::new(FetchError::transient(Some(503), "busy")),
        });
        assert_eq!(exhausted.kind(), ErrorKind::FetchExhausted);
        assert_eq!(
            StageError::Fetch(FetchError::terminal(Some(401), "no")).kind(),
            ErrorKind::TerminalFetch
        );
        assert_eq!(
            StageError::Landing(LandingError::MalformedRecord(
                crate::records::RecordError::MissingKey { index: 0 }
            ))
            .kind(),
            ErrorKind::MalformedRecord
        );
    }

    #[test]
    fn test_summary_counts_sorting_and_exit_code() {
        let summary = RunSummary::new(
            Uuid::new_v4(),
            false,
            Utc::now(),
            2,
            vec![
                report("2024-02", Stage::Certs, StageOutcome::NoData { skipped: 0 }),
                report(
                    "2024-01",
                    Stage::Certs,
                    StageOutcome::Checkpointed {
                        records: 7,
                        skipped: 0,
                        duplicates: 0,
                        object_key: "k".to_string(),
                        table: "t".to_string(),
                        load_job_id: "j".to_string(),
                        disposition: LoadDisposition::Loaded,
                    },
                ),
            ],
        );

        assert_eq!(summary.counts.checkpointed, 1);
        assert_eq!(summary.counts.no_data, 1);
        assert_eq!(summary.records_landed, 7);
        assert_eq!(summary.stages[0].period.to_string(), "2024-01");
        assert_eq!(summary.exit_code(), 0);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stages"][0]["outcome"], "checkpointed");
        assert_eq!(json["stages"][1]["outcome"], "no-data");
        assert_eq!(json["stages"][0]["period"], "2024-01");
    }

    #[test]
    fn test_exit_codes() {
        let failed = RunSummary::new(
            Uuid::new_v4(),
            false,
            Utc::now(),
            1,
            vec![report(
                "2024-01",
                Stage::Certs,
                StageOutcome::Failed {
                    error_kind: ErrorKind::FetchExhausted,
                    cause: "x".to_string(),
                },
            )],
        );
        assert_eq!(failed.exit_code(), 1);

        let cancelled = RunSummary::new(
            Uuid::new_v4(),
            false,
            Utc::now(),
            1,
            vec![report(
                "2024-01",
                Stage::Certs,
                StageOutcome::NotRun {
                    reason: NotRunReason::Cancelled,
                },
            )],
        );
        assert!(cancelled.interrupted());
        assert_eq!(cancelled.exit_code(), 2);
    }
}
