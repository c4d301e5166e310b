//! Error types shared across the EPC workspace

use thiserror::Error;

/// Result type alias for EPC operations
pub type Result<T> = std::result::Result<T, EpcError>;

/// Main error type for shared EPC types and utilities
#[derive(Error, Debug)]
pub enum EpcError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid month '{0}': expected YYYY-MM with month 01-12")]
    InvalidMonth(String),

    #[error("Invalid range: end {end} is before start {start}")]
    InvalidRange { start: String, end: String },

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Stage {stage} cannot run on period {period}")]
    StagePeriodMismatch { stage: String, period: String },

    #[error("Parse error: {0}")]
    Parse(String),
}
