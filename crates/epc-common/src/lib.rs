//! EPC Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared domain types, checksums, logging and error handling for the EPC
//! ingestion workspace.
//!
//! # Overview
//!
//! - **Types**: record kinds, ingestion stages, months and partition keys
//! - **Checksums**: SHA-256 helpers used for landed object integrity
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Error Handling**: [`EpcError`] and the [`Result`] alias
//!
//! # Example
//!
//! ```no_run
//! use epc_common::types::{Kind, Month, PartitionKey, Period};
//!
//! fn partitions() -> epc_common::Result<Vec<PartitionKey>> {
//!     let start: Month = "2024-01".parse()?;
//!     let end: Month = "2024-03".parse()?;
//!     Ok(Month::range_inclusive(start, end)?
//!         .into_iter()
//!         .map(|m| PartitionKey::new(Kind::Domestic, Period::Month(m)))
//!         .collect())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{EpcError, Result};
