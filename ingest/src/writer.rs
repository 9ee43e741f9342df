use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use crate::batch::BatchItem;
use crate::sinks::{InsertResult, RowError, RowErrorReason, Sink};

/// Per-row result of a batched write, handed back to the caller that submitted the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    /// The row was already stored by an earlier delivery. Callers treat this as success.
    Duplicate,
    PermanentReject(String),
    TransientFailure(String),
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Success => "success",
            WriteOutcome::Duplicate => "duplicate",
            WriteOutcome::PermanentReject(_) => "permanent_reject",
            WriteOutcome::TransientFailure(_) => "transient_failure",
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, WriteOutcome::Success | WriteOutcome::Duplicate)
    }
}

/// What a caller gets back once the batch holding its row was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWrite {
    pub outcome: WriteOutcome,
    pub batch_id: u64,
    /// Time the whole batch spent in the sink call.
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorType {
    Duplicate,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasonClass {
    pub terminal: bool,
    pub error_type: ErrorType,
}

/// Classify a row-level rejection. Reasons we do not know are transient.
pub fn map_reason(reason: &RowErrorReason) -> ReasonClass {
    match reason {
        RowErrorReason::Duplicate => ReasonClass {
            terminal: false,
            error_type: ErrorType::Duplicate,
        },
        RowErrorReason::Invalid => ReasonClass {
            terminal: true,
            error_type: ErrorType::Permanent,
        },
        RowErrorReason::Stopped | RowErrorReason::Timeout | RowErrorReason::Other(_) => {
            ReasonClass {
                terminal: false,
                error_type: ErrorType::Transient,
            }
        }
    }
}

/// Turn the result of inserting `len` rows into one outcome per row, in submission order.
pub fn classify(len: usize, result: InsertResult) -> Vec<WriteOutcome> {
    match result {
        InsertResult::Success => vec![WriteOutcome::Success; len],
        InsertResult::TotalFailure(err) => {
            vec![WriteOutcome::TransientFailure(err.to_string()); len]
        }
        InsertResult::PartialFailure(errors) => {
            // Keep the most severe error reported for each row
            let mut worst: HashMap<usize, (ReasonClass, RowError)> = HashMap::new();
            for row_error in errors {
                if row_error.index >= len {
                    warn!(
                        index = row_error.index,
                        batch_len = len,
                        reason = %row_error.reason,
                        "sink reported an error for a row outside the batch"
                    );
                    continue;
                }
                let class = map_reason(&row_error.reason);
                match worst.get(&row_error.index) {
                    Some((current, _)) if current.error_type >= class.error_type => {}
                    _ => {
                        worst.insert(row_error.index, (class, row_error));
                    }
                }
            }

            (0..len)
                .map(|index| match worst.remove(&index) {
                    None => WriteOutcome::Success,
                    Some((class, row_error)) => match class.error_type {
                        ErrorType::Duplicate => WriteOutcome::Duplicate,
                        ErrorType::Permanent => WriteOutcome::PermanentReject(describe(&row_error)),
                        ErrorType::Transient => {
                            WriteOutcome::TransientFailure(describe(&row_error))
                        }
                    },
                })
                .collect()
        }
    }
}

fn describe(row_error: &RowError) -> String {
    if row_error.message.is_empty() {
        row_error.reason.to_string()
    } else {
        format!("{}: {}", row_error.reason, row_error.message)
    }
}

/// Writes flushed batches to the sink and resolves every item's pending result.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn Sink + Send + Sync>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink + Send + Sync>) -> Self {
        Self { sink }
    }

    #[instrument(skip_all, fields(batch_id = batch_id, batch_len = items.len()))]
    pub async fn write(&self, batch_id: u64, items: Vec<BatchItem>) {
        if items.is_empty() {
            return;
        }

        let rows = items.iter().map(|item| item.event.to_row()).collect();

        let start = Instant::now();
        let result = self.sink.insert(rows).await;
        let latency = start.elapsed();
        histogram!("ingest_sink_write_duration_seconds").record(latency.as_secs_f64());

        let outcomes = classify(items.len(), result);

        for (item, outcome) in items.into_iter().zip(outcomes) {
            let envelope = &item.event.envelope;
            match &outcome {
                WriteOutcome::Success => {
                    debug!(idempotency_key = envelope.key(), "row written");
                    counter!("ingest_events_written_total").increment(1);
                }
                WriteOutcome::Duplicate => debug!(
                    idempotency_key = envelope.key(),
                    tenant_id = envelope.tenant_id.as_str(),
                    event_type = envelope.event_type.as_str(),
                    "row already stored"
                ),
                WriteOutcome::PermanentReject(reason) => error!(
                    idempotency_key = envelope.key(),
                    tenant_id = envelope.tenant_id.as_str(),
                    event_type = envelope.event_type.as_str(),
                    batch_id,
                    "sink permanently rejected row: {reason}"
                ),
                WriteOutcome::TransientFailure(reason) => warn!(
                    idempotency_key = envelope.key(),
                    tenant_id = envelope.tenant_id.as_str(),
                    event_type = envelope.event_type.as_str(),
                    batch_id,
                    "transient failure writing row: {reason}"
                ),
            }
            counter!("ingest_write_outcomes_total", "outcome" => outcome.as_str()).increment(1);

            let resolved = ResolvedWrite {
                outcome,
                batch_id,
                latency,
            };
            if item.responder.send(resolved).is_err() {
                debug!(
                    idempotency_key = item.event.key(),
                    "caller stopped waiting for the write result"
                );
            }
        }
    }
}
