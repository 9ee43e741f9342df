use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::event::EventRow;

pub mod insert_all;
pub mod memory;
pub mod print;

/// A row submitted to the sink, tagged with the deduplication token the sink collapses on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkRow {
    #[serde(rename = "insertId")]
    pub insert_id: String,
    pub json: EventRow,
}

/// Why the sink rejected a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowErrorReason {
    /// A row with the same insert id was already stored.
    Duplicate,
    /// The row does not fit the table schema or its data is invalid.
    Invalid,
    /// The row was fine but the request was stopped because of another row.
    Stopped,
    Timeout,
    Other(String),
}

impl From<&str> for RowErrorReason {
    fn from(reason: &str) -> Self {
        match reason.trim().to_ascii_lowercase().as_str() {
            "duplicate" => RowErrorReason::Duplicate,
            "invalid" | "invalidquery" | "schema" => RowErrorReason::Invalid,
            "stopped" => RowErrorReason::Stopped,
            "timeout" => RowErrorReason::Timeout,
            _ => RowErrorReason::Other(reason.to_string()),
        }
    }
}

impl fmt::Display for RowErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowErrorReason::Duplicate => f.write_str("duplicate"),
            RowErrorReason::Invalid => f.write_str("invalid"),
            RowErrorReason::Stopped => f.write_str("stopped"),
            RowErrorReason::Timeout => f.write_str("timeout"),
            RowErrorReason::Other(reason) => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Position of the row in the submitted batch.
    pub index: usize,
    pub reason: RowErrorReason,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    RequestFailed(String),
    #[error("sink answered with status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("failed to parse sink response: {0}")]
    InvalidResponse(String),
    #[error("invalid sink configuration: {0}")]
    ConfigurationError(String),
}

/// Result of one batched insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertResult {
    Success,
    /// The call failed before any row-level detail was available.
    TotalFailure(SinkError),
    /// Rows not listed were stored.
    PartialFailure(Vec<RowError>),
}

#[async_trait]
pub trait Sink {
    async fn insert(&self, rows: Vec<SinkRow>) -> InsertResult;
}
