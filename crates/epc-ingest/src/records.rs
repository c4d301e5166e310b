//! Raw row normalization
//!
//! Upstream rows are opaque JSON objects. We only pull out the fields needed
//! for keying and indexing and keep the full row as `payload`. Field names
//! vary between the API (`lmk-key`) and bulk CSVs (`LMK_KEY`), so lookups
//! ignore case and `-`/`_`/space separators.

use chrono::NaiveDate;
use epc_common::types::Stage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// What to do with a row that has no certificate key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Fail the whole partition
    #[default]
    Fail,
    /// Drop the row and count it
    Skip,
}

impl std::str::FromStr for MalformedPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail" | "strict" => Ok(MalformedPolicy::Fail),
            "skip" | "lenient" => Ok(MalformedPolicy::Skip),
            other => Err(anyhow::anyhow!("Invalid malformed-record policy: {}", other)),
        }
    }
}

impl std::fmt::Display for MalformedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MalformedPolicy::Fail => write!(f, "fail"),
            MalformedPolicy::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Row {index} has no lmk-key")]
    MissingKey { index: usize },

    #[error("Row {index} is not a JSON object")]
    NotAnObject { index: usize },
}

/// Normalized record as landed and loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique within a landed batch
    pub record_id: String,
    pub lmk_key: String,
    pub lodgement_date: Option<NaiveDate>,
    pub postcode: Option<String>,
    pub uprn: Option<String>,
    pub payload: Value,
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn field<'a>(row: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    let wanted = normalize_name(name);
    row.get(name)
        .or_else(|| row.iter().find(|(k, _)| normalize_name(k) == wanted).map(|(_, v)| v))
}

/// Non-empty trimmed string form of a scalar field
fn text(row: &Map<String, Value>, name: &str) -> Option<String> {
    match field(row, name)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// ISO date from the first ten characters, so timestamps also parse
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Tag a recommendation row with the certificate it was fetched for
///
/// Rows that already carry a key (in any spelling) are left alone.
pub fn with_certificate_key(raw: Value, lmk_key: &str) -> Value {
    match raw {
        Value::Object(mut row) => {
            if text(&row, "lmk-key").is_none() {
                row.insert("lmk-key".to_string(), Value::String(lmk_key.to_string()));
            }
            Value::Object(row)
        },
        other => other,
    }
}

/// Stateful per-batch normalizer
///
/// Tracks record ids already emitted so duplicates within one batch are
/// dropped (first occurrence wins).
#[derive(Debug)]
pub struct Normalizer {
    stage: Stage,
    policy: MalformedPolicy,
    seen: HashSet<String>,
    per_certificate: HashMap<String, u32>,
    rows: usize,
    skipped: usize,
    duplicates: usize,
}

impl Normalizer {
    pub fn new(stage: Stage, policy: MalformedPolicy) -> Self {
        Self {
            stage,
            policy,
            seen: HashSet::new(),
            per_certificate: HashMap::new(),
            rows: 0,
            skipped: 0,
            duplicates: 0,
        }
    }

    /// Normalize one raw row
    ///
    /// Returns `Ok(None)` for rows that were skipped or were duplicates.
    pub fn push(&mut self, raw: Value) -> Result<Option<Record>, RecordError> {
        let index = self.rows;
        self.rows += 1;

        let Value::Object(row) = raw else {
            return self.malformed(RecordError::NotAnObject { index });
        };

        let Some(lmk_key) = text(&row, "lmk-key") else {
            return self.malformed(RecordError::MissingKey { index });
        };

        let record_id = match self.stage {
            Stage::Certs => lmk_key.clone(),
            Stage::Recs => {
                let occurrence = self.per_certificate.entry(lmk_key.clone()).or_insert(0);
                *occurrence += 1;
                // Positional ids are namespaced so they never collide with a real item
                match text(&row, "improvement-item") {
                    Some(item) => format!("{}#{}", lmk_key, item),
                    None => format!("{}#row-{}", lmk_key, occurrence),
                }
            },
        };

        if !self.seen.insert(record_id.clone()) {
            self.duplicates += 1;
            return Ok(None);
        }

        let (postcode, uprn) = match self.stage {
            Stage::Certs => (text(&row, "postcode"), text(&row, "uprn")),
            Stage::Recs => (None, None),
        };
        let lodgement_date = text(&row, "lodgement-date").as_deref().and_then(parse_date);

        Ok(Some(Record {
            record_id,
            lmk_key,
            lodgement_date,
            postcode,
            uprn,
            payload: Value::Object(row),
        }))
    }

    fn malformed(&mut self, err: RecordError) -> Result<Option<Record>, RecordError> {
        match self.policy {
            MalformedPolicy::Fail => Err(err),
            MalformedPolicy::Skip => {
                self.skipped += 1;
                Ok(None)
            },
        }
    }

    pub fn rows_seen(&self) -> usize {
        self.rows
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}
