use axum::extract::State;
use axum::http::StatusCode;
use bytes::Bytes;
use ingest_common::envelope::Envelope;
use ingest_common::metrics::report_dropped_events;
use ingest_common::pubsub::PushRequest;
use metrics::counter;
use tracing::{instrument, warn, Span};

use crate::api::IngestError;
use crate::batch::AccumulatorError;
use crate::event::NormalizedEvent;
use crate::router;
use crate::writer::WriteOutcome;

/// Handle one push delivery carrying one envelope.
///
/// Answers 204 once the event is stored (or sampled out), and an error status otherwise.
/// The transport retries on 503 and dead-letters on 4xx.
#[instrument(
    skip_all,
    fields(message_id, idempotency_key, tenant_id, event_type, batch_id)
)]
pub async fn push(
    state: State<router::State>,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    counter!("ingest_events_received_total").increment(1);

    let result = process(&state, &body).await;
    if let Err(err) = &result {
        let cause = if err.is_terminal() { "rejected" } else { "retryable" };
        report_dropped_events(cause, 1);
        warn!("push delivery failed: {err}");
    }
    result
}

async fn process(state: &router::State, body: &[u8]) -> Result<StatusCode, IngestError> {
    let request: PushRequest = serde_json::from_slice(body)
        .map_err(|e| IngestError::RequestDecodingError(e.to_string()))?;
    let message = request
        .message
        .decode()
        .map_err(|e| IngestError::RequestDecodingError(format!("data is not base64: {e}")))?;
    Span::current().record("message_id", message.message_id.as_str());

    let envelope = Envelope::from_bytes(&message.data)?;
    if let Some(tenant_id) = &envelope.tenant_id {
        Span::current().record("tenant_id", tenant_id.as_str());
    }
    if let Some(event_type) = &envelope.event_type {
        Span::current().record("event_type", event_type.as_str());
    }

    let envelope = envelope.validate()?;
    Span::current().record("idempotency_key", envelope.key());

    if !state.sampler.keep(&envelope) {
        report_dropped_events("sampled_out", 1);
        return Ok(StatusCode::NO_CONTENT);
    }

    let event = NormalizedEvent::new(
        envelope,
        state.normalizer.as_ref(),
        state.timesource.current_time(),
    );

    let pending = state.accumulator.add(event).await.map_err(|err| match err {
        AccumulatorError::Closed => IngestError::ShuttingDown,
    })?;
    Span::current().record("batch_id", pending.batch_id());

    // Giving up the wait leaves the event in its batch, the write still happens
    let resolved = tokio::time::timeout(state.wait_timeout, pending.wait())
        .await
        .map_err(|_| IngestError::WaitTimeout)?;

    match resolved.outcome {
        WriteOutcome::Success | WriteOutcome::Duplicate => Ok(StatusCode::NO_CONTENT),
        WriteOutcome::PermanentReject(reason) => Err(IngestError::PermanentRejectError(reason)),
        WriteOutcome::TransientFailure(reason) => Err(IngestError::RetryableSinkError(reason)),
    }
}
