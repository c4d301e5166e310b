//! EPC Ingest - partitioned certificate ingestion tool

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use epc_common::logging::{init_logging, LogConfig, LogLevel};
use epc_common::types::{Kind, Month, PeriodRange, Stage};
use epc_ingest::checkpoint::CheckpointStore;
use epc_ingest::client::EpcClient;
use epc_ingest::config::IngestConfig;
use epc_ingest::landing::LandingWriter;
use epc_ingest::orchestrator::{
    BackfillRequest, BackfillTarget, Orchestrator, RunRequest, RunSummary,
};
use epc_ingest::recommendations::{ArchiveFetcher, ArchiveSource};
use epc_ingest::storage::open_store;
use epc_ingest::warehouse::{PostgresWarehouse, WarehouseLoader};
use serde::Serialize;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "epc-ingest")]
#[command(author, version, about = "EPC certificate ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest certificates (and optionally recommendations) for a month range
    Run {
        /// First month, YYYY-MM (default: INGEST_START_MONTH)
        #[arg(long)]
        start: Option<Month>,

        /// Last month, YYYY-MM, inclusive (default: INGEST_END_MONTH)
        #[arg(long)]
        end: Option<Month>,

        /// Kinds to ingest (default: all)
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<Kind>,

        /// Also ingest recommendations for each month
        #[arg(long)]
        with_recs: bool,

        /// Only report what would run
        #[arg(long)]
        dry_run: bool,

        /// Clear this stage's checkpoints over the range first
        #[arg(long)]
        reset: Option<Stage>,

        /// Partitions processed at once (default: INGEST_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop starting new stages after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Clear checkpoints so partitions are ingested again
    Reset {
        #[command(flatten)]
        range: RangeArgs,

        /// Stage to clear
        #[arg(long)]
        stage: Stage,
    },

    /// Show checkpoint state
    Status {
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Ingest recommendations for a year archive or specific certificates
    BackfillRecs {
        #[arg(long)]
        kind: Kind,

        /// Archive year
        #[arg(long, conflicts_with = "lmk")]
        year: Option<u16>,

        /// Archive path or URL (default: INGEST_RECS_ARCHIVE_URL template)
        #[arg(long, requires = "year")]
        archive: Option<String>,

        /// Certificate keys
        #[arg(long, num_args = 1..)]
        lmk: Vec<String>,

        #[arg(long)]
        dry_run: bool,
    },
}

/// Partition selection shared by `reset` and `status`
#[derive(Args, Debug)]
struct RangeArgs {
    /// First period: YYYY-MM, or YYYY with --years
    #[arg(long)]
    start: Option<String>,

    /// Last period, inclusive
    #[arg(long)]
    end: Option<String>,

    /// Treat --start/--end as years (archive backfills)
    #[arg(long)]
    years: bool,

    /// Select certificate partitions instead of a range
    #[arg(long, num_args = 1..)]
    lmk: Vec<String>,

    /// Kinds (default: all)
    #[arg(long, value_delimiter = ',')]
    kinds: Vec<Kind>,
}

impl RangeArgs {
    fn kinds(&self) -> Vec<Kind> {
        selected_kinds(&self.kinds)
    }

    fn period_range(&self, config: &IngestConfig) -> Result<PeriodRange> {
        if !self.lmk.is_empty() {
            return Ok(PeriodRange::Certificates(self.lmk.clone()));
        }

        if self.years {
            let year = |value: &Option<String>, flag: &str| -> Result<u16> {
                value
                    .as_deref()
                    .with_context(|| format!("{} is required with --years", flag))?
                    .trim()
                    .parse()
                    .with_context(|| format!("{} must be a year", flag))
            };
            let (start, end) = (year(&self.start, "--start")?, year(&self.end, "--end")?);
            if end < start {
                anyhow::bail!("--end ({}) is before --start ({})", end, start);
            }
            return Ok(PeriodRange::Years { start, end });
        }

        let month = |value: &Option<String>, fallback: Option<Month>, flag: &str| -> Result<Month> {
            match value {
                Some(s) => s.parse().with_context(|| format!("Invalid {}", flag)),
                None => fallback.with_context(|| format!("{} is required", flag)),
            }
        };
        let start = month(&self.start, config.start_month, "--start")?;
        let end = month(&self.end, config.end_month, "--end")?;
        Ok(PeriodRange::months(start, end)?)
    }
}

fn selected_kinds(kinds: &[Kind]) -> Vec<Kind> {
    if kinds.is_empty() {
        Kind::ALL.to_vec()
    } else {
        kinds.to_vec()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

async fn build_orchestrator(config: &IngestConfig, with_warehouse: bool) -> Result<Orchestrator> {
    let store = open_store(&config.storage)
        .await
        .context("Failed to open object store")?;
    info!(location = %store.location(), "Object store ready");

    let client = EpcClient::new(&config.api, config.retry)?;
    let archives = ArchiveFetcher::new(config.retry)?;

    let orchestrator = Orchestrator::new(
        client,
        CheckpointStore::new(store.clone()),
        LandingWriter::new(store.clone(), config.malformed_policy),
        archives,
    )
    .with_concurrency(config.concurrency)
    .with_deadline(config.run_deadline());

    if !with_warehouse {
        return Ok(orchestrator);
    }

    let warehouse = PostgresWarehouse::connect(&config.warehouse)
        .await
        .context("Failed to connect to warehouse")?;
    Ok(orchestrator.with_loader(WarehouseLoader::new(Arc::new(warehouse), store)))
}

/// Cancel the run on Ctrl-C; in-flight stages still finish
fn cancel_on_interrupt(orchestrator: &Orchestrator) {
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight stages");
            cancel.cancel();
        }
    });
}

fn finish(summary: &RunSummary) -> Result<ExitCode> {
    print_json(summary)?;
    for failure in summary.failures() {
        warn!(kind = %failure.kind, period = %failure.period, stage = %failure.stage, "Partition failed");
    }
    Ok(ExitCode::from(summary.exit_code()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("epc-ingest")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            start,
            end,
            kinds,
            with_recs,
            dry_run,
            reset,
            concurrency,
            deadline_secs,
        } => {
            if !dry_run {
                config.require_credentials()?;
            }

            let start = start
                .or(config.start_month)
                .context("--start (or INGEST_START_MONTH) is required")?;
            let end = end
                .or(config.end_month)
                .context("--end (or INGEST_END_MONTH) is required")?;

            let mut orchestrator = build_orchestrator(&config, !dry_run).await?;
            if let Some(concurrency) = concurrency {
                orchestrator = orchestrator.with_concurrency(concurrency);
            }
            if let Some(secs) = deadline_secs {
                orchestrator = orchestrator.with_deadline(Some(Duration::from_secs(secs)));
            }
            cancel_on_interrupt(&orchestrator);

            let summary = orchestrator
                .run(RunRequest {
                    kinds: selected_kinds(&kinds),
                    start,
                    end,
                    with_recs,
                    dry_run,
                    reset,
                })
                .await?;
            finish(&summary)
        },
        Command::Reset { range, stage } => {
            let orchestrator = build_orchestrator(&config, false).await?;
            let period_range = range.period_range(&config)?;
            let cleared = orchestrator
                .reset(&range.kinds(), &period_range, &[stage])
                .await?;
            info!(stage = %stage, cleared = cleared.len(), "Reset complete");
            print_json(&serde_json::json!({ "cleared": cleared }))?;
            Ok(ExitCode::SUCCESS)
        },
        Command::Status { range } => {
            let orchestrator = build_orchestrator(&config, false).await?;
            let period_range = range.period_range(&config)?;
            let checkpoints = orchestrator.status(&range.kinds(), &period_range).await?;
            print_json(&checkpoints)?;
            Ok(ExitCode::SUCCESS)
        },
        Command::BackfillRecs {
            kind,
            year,
            archive,
            lmk,
            dry_run,
        } => {
            let target = match year {
                Some(year) => {
                    let source = match archive {
                        Some(location) => ArchiveSource::parse(&location),
                        None => ArchiveSource::from_template(
                            config
                                .recs_archive_url
                                .as_deref()
                                .context("--archive or INGEST_RECS_ARCHIVE_URL is required")?,
                            kind,
                            year,
                        ),
                    };
                    BackfillTarget::Year { year, source }
                },
                None if !lmk.is_empty() => {
                    if !dry_run {
                        config.require_credentials()?;
                    }
                    BackfillTarget::Certificates(lmk)
                },
                None => anyhow::bail!("Either --year or --lmk is required"),
            };

            let orchestrator = build_orchestrator(&config, !dry_run).await?;
            cancel_on_interrupt(&orchestrator);

            let summary = orchestrator
                .backfill(BackfillRequest {
                    kind,
                    target,
                    dry_run,
                })
                .await?;
            finish(&summary)
        },
    }
}
