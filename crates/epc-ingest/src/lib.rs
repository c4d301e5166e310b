//! EPC ingestion pipeline
//!
//! Pulls Energy Performance Certificate records from the Open Data
//! Communities API month by month, lands each partition as one immutable
//! object, loads it into the warehouse and records a checkpoint so reruns
//! skip finished work.
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod landing;
pub mod orchestrator;
pub mod recommendations;
pub mod records;
pub mod storage;
pub mod warehouse;

pub use config::IngestConfig;
pub use orchestrator::{
    BackfillRequest, BackfillTarget, Orchestrator, RunRequest, RunSummary, StageOutcome,
};
