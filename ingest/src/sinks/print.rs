use async_trait::async_trait;
use metrics::{counter, histogram};
use tracing::info;

use crate::sinks::{InsertResult, Sink, SinkRow};

/// Logs every row instead of storing it. Useful for local debugging.
pub struct PrintSink {}

#[async_trait]
impl Sink for PrintSink {
    async fn insert(&self, rows: Vec<SinkRow>) -> InsertResult {
        let span = tracing::span!(tracing::Level::INFO, "batch of rows");
        let _enter = span.enter();

        histogram!("ingest_print_sink_batch_size").record(rows.len() as f64);
        counter!("ingest_print_sink_rows_total").increment(rows.len() as u64);
        for row in rows {
            info!(insert_id = row.insert_id, "row: {:?}", row.json);
        }

        InsertResult::Success
    }
}
