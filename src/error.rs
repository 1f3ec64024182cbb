// ❗ Error taxonomy for the ingestion engine
// Batch-fatal failures are typed errors; per-row failures are plain data
// collected into the run result.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The uploaded bytes could not be turned into a table we understand.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("artifact is empty")]
    EmptyTable,

    #[error("artifact of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("could not decode text: {0}")]
    Decode(String),

    #[error("workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("no header row found in the first {0} rows")]
    HeaderNotFound(usize),

    #[error("mandatory columns missing: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("parse failure: {0}")]
    Parse(#[from] ParseError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("ingestion run exceeded its deadline during {stage}")]
    DeadlineExceeded { stage: &'static str },
}

impl IngestError {
    pub fn is_parse(&self) -> bool {
        matches!(self, IngestError::Parse(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Entity level a row failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLevel {
    Counterparty,
    Contract,
    DebtCredit,
}

impl EntityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityLevel::Counterparty => "counterparty",
            EntityLevel::Contract => "contract",
            EntityLevel::DebtCredit => "debt_credit",
        }
    }
}

impl fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate that could not be written. Never aborts the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    pub level: EntityLevel,
    pub natural_key: String,
    pub field: String,
    pub message: String,
}

impl RowFailure {
    pub fn new(level: EntityLevel, natural_key: impl Into<String>, field: impl Into<String>, message: impl Into<String>) -> Self {
        RowFailure {
            level,
            natural_key: natural_key.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({}): {}", self.level, self.natural_key, self.field, self.message)
    }
}
