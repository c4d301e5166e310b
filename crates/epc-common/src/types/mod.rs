//! Shared domain types for EPC ingestion
//!
//! A unit of work is a [`PartitionKey`] (a record [`Kind`] plus a
//! [`Period`]) run through one or more [`Stage`]s. Every type here has a
//! stable text form that is used in object keys, checkpoint documents and
//! the CLI, so `Display` and `FromStr` round-trip.

use crate::error::{EpcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Record kind served by the upstream API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    /// Domestic certificates
    Domestic,
    /// Non-domestic certificates
    NonDomestic,
}

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Domestic, Kind::NonDomestic];

    /// Path segment used by the API and by object keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Domestic => "domestic",
            Kind::NonDomestic => "non-domestic",
        }
    }

    /// Identifier-safe form used for warehouse table names
    pub fn table_slug(&self) -> &'static str {
        match self {
            Kind::Domestic => "domestic",
            Kind::NonDomestic => "non_domestic",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = EpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "domestic" => Ok(Kind::Domestic),
            "non-domestic" | "nondomestic" => Ok(Kind::NonDomestic),
            other => Err(EpcError::Parse(format!("unknown kind: {}", other))),
        }
    }
}

/// Ingestion stage, checkpointed independently per partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Certificate search
    Certs,
    /// Recommendations for certificates
    Recs,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Certs, Stage::Recs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Certs => "certs",
            Stage::Recs => "recs",
        }
    }

    /// Whether this stage has a defined meaning for `period`
    pub fn accepts(&self, period: &Period) -> bool {
        match (self, period) {
            (Stage::Certs, Period::Month(_)) => true,
            (Stage::Certs, _) => false,
            (Stage::Recs, _) => true,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = EpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "certs" | "certificates" => Ok(Stage::Certs),
            "recs" | "recommendations" => Ok(Stage::Recs),
            other => Err(EpcError::Parse(format!("unknown stage: {}", other))),
        }
    }
}

/// Calendar month, `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month {
    year: u16,
    month: u8,
}

impl Month {
    pub fn new(year: u16, month: u8) -> Result<Self> {
        if !(1..=12).contains(&month) || year > 9999 {
            return Err(EpcError::InvalidMonth(format!("{:04}-{:02}", year, month)));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// The following calendar month
    pub fn succ(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// All months from `start` to `end`, both inclusive
    pub fn range_inclusive(start: Month, end: Month) -> Result<Vec<Month>> {
        if end < start {
            return Err(EpcError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let mut months = Vec::new();
        let mut current = start;
        while current <= end {
            months.push(current);
            current = current.succ();
        }
        Ok(months)
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = EpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || EpcError::InvalidMonth(s.to_string());

        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4
            || month.len() != 2
            || !year.bytes().all(|b| b.is_ascii_digit())
            || !month.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let year: u16 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        Month::new(year, month).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Month {
    type Error = EpcError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Month> for String {
    fn from(value: Month) -> Self {
        value.to_string()
    }
}

const CERTIFICATE_PREFIX: &str = "lmk-";

/// Time slice (or single certificate) a partition covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Period {
    Month(Month),
    /// Full-year archive batch
    Year(u16),
    /// A single certificate, by LMK key
    Certificate(String),
}

impl Period {
    /// Build a certificate period, rejecting keys that cannot be used as a path segment
    pub fn certificate(lmk_key: impl Into<String>) -> Result<Self> {
        let lmk_key = lmk_key.into();
        let valid = !lmk_key.is_empty()
            && lmk_key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(EpcError::InvalidPeriod(format!(
                "invalid certificate key: {:?}",
                lmk_key
            )));
        }
        Ok(Period::Certificate(lmk_key))
    }

    pub fn as_month(&self) -> Option<Month> {
        match self {
            Period::Month(m) => Some(*m),
            _ => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Month(m) => write!(f, "{}", m),
            Period::Year(y) => write!(f, "{:04}", y),
            Period::Certificate(key) => write!(f, "{}{}", CERTIFICATE_PREFIX, key),
        }
    }
}

impl FromStr for Period {
    type Err = EpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix(CERTIFICATE_PREFIX) {
            return Period::certificate(key);
        }
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            let year = s
                .parse()
                .map_err(|_| EpcError::InvalidPeriod(s.to_string()))?;
            return Ok(Period::Year(year));
        }
        s.parse::<Month>()
            .map(Period::Month)
            .map_err(|_| EpcError::InvalidPeriod(s.to_string()))
    }
}

impl TryFrom<String> for Period {
    type Error = EpcError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// Set of periods selected for a reset or status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodRange {
    /// Months between two bounds, inclusive
    Months { start: Month, end: Month },
    /// Years between two bounds, inclusive
    Years { start: u16, end: u16 },
    /// Exactly these certificates
    Certificates(Vec<String>),
}

impl PeriodRange {
    pub fn months(start: Month, end: Month) -> Result<Self> {
        if end < start {
            return Err(EpcError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(PeriodRange::Months { start, end })
    }

    pub fn contains(&self, period: &Period) -> bool {
        match (self, period) {
            (PeriodRange::Months { start, end }, Period::Month(m)) => start <= m && m <= end,
            (PeriodRange::Years { start, end }, Period::Year(y)) => start <= y && y <= end,
            (PeriodRange::Certificates(keys), Period::Certificate(key)) => keys.contains(key),
            _ => false,
        }
    }
}

/// Independent unit of work: one kind over one period
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub kind: Kind,
    pub period: Period,
}

impl PartitionKey {
    pub fn new(kind: Kind, period: Period) -> Self {
        Self { kind, period }
    }

    pub fn month(kind: Kind, month: Month) -> Self {
        Self::new(kind, Period::Month(month))
    }

    /// Fail unless `stage` is defined for this partition's period
    pub fn check_stage(&self, stage: Stage) -> Result<()> {
        if stage.accepts(&self.period) {
            Ok(())
        } else {
            Err(EpcError::StagePeriodMismatch {
                stage: stage.to_string(),
                period: self.period.to_string(),
            })
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.period)
    }
}
