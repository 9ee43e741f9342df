use chrono::{DateTime, Utc};
use ingest_common::envelope::ValidatedEnvelope;
use serde::Serialize;

use crate::normalizer::Normalizer;
use crate::sinks::SinkRow;

/// A validated, sampled-in event with its payload normalized, ready to be batched.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub envelope: ValidatedEnvelope,
    pub received_at: DateTime<Utc>,
    pub sampled: bool,
}

/// One stored row, keyed by the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRow {
    pub idempotency_key: String,
    pub envelope_version: i64,
    pub event_type: String,
    pub schema_version: i64,
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub source: Option<String>,
    // JSON-encoded payload
    pub payload: String,
    pub sampled: bool,
}

impl NormalizedEvent {
    pub fn new(
        mut envelope: ValidatedEnvelope,
        normalizer: &(dyn Normalizer + Send + Sync),
        received_at: DateTime<Utc>,
    ) -> Self {
        envelope.payload = normalizer.normalize(std::mem::take(&mut envelope.payload));
        Self {
            envelope,
            received_at,
            sampled: true,
        }
    }

    pub fn key(&self) -> &str {
        self.envelope.key()
    }

    pub fn to_row(&self) -> SinkRow {
        let envelope = &self.envelope;
        SinkRow {
            insert_id: envelope.key().to_string(),
            json: EventRow {
                idempotency_key: envelope.key().to_string(),
                envelope_version: envelope.envelope_version,
                event_type: envelope.event_type.clone(),
                schema_version: envelope.schema_version,
                tenant_id: envelope.tenant_id.clone(),
                occurred_at: envelope.occurred_at,
                received_at: self.received_at,
                trace_id: envelope.trace_id.clone(),
                source: envelope.source.clone(),
                payload: serde_json::Value::Object(envelope.payload.clone()).to_string(),
                sampled: self.sampled,
            },
        }
    }
}

/// A minimal valid event keyed by `key`, for tests.
#[cfg(test)]
pub(crate) fn sample_event(key: &str) -> NormalizedEvent {
    use ingest_common::envelope::Envelope;

    let envelope = Envelope::from_bytes(
        serde_json::json!({
            "envelopeVersion": 1,
            "eventType": "call.completed",
            "schemaVersion": 1,
            "tenantId": "tenant-a",
            "occurredAt": "2024-05-01T12:00:00Z",
            "payload": {"call_id": key}
        })
        .to_string()
        .as_bytes(),
    )
    .map(Envelope::validate)
    .expect("sample envelope parses")
    .expect("sample envelope validates");

    NormalizedEvent::new(envelope, &crate::normalizer::Passthrough, Utc::now())
}
