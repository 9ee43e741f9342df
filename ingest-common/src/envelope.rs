//! The event envelope wire format shared by ingestion and replay.
//!
//! Decoding ([`Envelope::from_bytes`]) only checks that the bytes hold a JSON object whose
//! fields have the right types. Structural validation and idempotency key derivation happen in
//! [`Envelope::validate`], which produces a [`ValidatedEnvelope`].
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Required fields, in the order they are reported when missing.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "envelopeVersion",
    "eventType",
    "schemaVersion",
    "tenantId",
    "occurredAt",
    "payload",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("envelope is not valid UTF-8")]
    InvalidEncoding,
    #[error("envelope is not a valid JSON document: {0}")]
    InvalidJson(String),
}

/// Validation failures are terminal: resubmitting the same envelope cannot succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("envelope is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("occurredAt is not a valid timestamp: {0:?}")]
    BadTimestamp(String),
    #[error("envelope carries no idempotency key: expected payload.call_id, payload.message_id or traceId")]
    NoIdempotencyKey,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(alias = "envelope_version", skip_serializing_if = "Option::is_none")]
    pub envelope_version: Option<i64>,
    #[serde(alias = "event_type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(alias = "schema_version", skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i64>,
    #[serde(alias = "tenant_id", skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(alias = "occurred_at", skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<String>,
    #[serde(alias = "trace_id", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
}

/// Which envelope field the idempotency key was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    CallId,
    MessageId,
    TraceId,
}

impl KeySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySource::CallId => "call_id",
            KeySource::MessageId => "message_id",
            KeySource::TraceId => "trace_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey {
    pub value: String,
    pub source: KeySource,
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// An envelope that passed structural validation, with its idempotency key derived.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEnvelope {
    pub envelope_version: i64,
    pub event_type: String,
    pub schema_version: i64,
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub source: Option<String>,
    pub payload: Map<String, Value>,
    pub idempotency_key: IdempotencyKey,
}

impl ValidatedEnvelope {
    pub fn key(&self) -> &str {
        &self.idempotency_key.value
    }
}

impl Envelope {
    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, FormatError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FormatError::InvalidEncoding)?;
        let value: Value =
            serde_json::from_str(text).map_err(|e| FormatError::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(FormatError::InvalidJson("expected a JSON object".to_string()));
        }
        serde_json::from_value(value).map_err(|e| FormatError::InvalidJson(e.to_string()))
    }

    /// Names of required fields that are absent, null, or empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let present = [
            self.envelope_version.is_some(),
            non_empty(&self.event_type).is_some(),
            self.schema_version.is_some(),
            non_empty(&self.tenant_id).is_some(),
            non_empty(&self.occurred_at).is_some(),
            self.payload.as_ref().is_some_and(|p| !p.is_empty()),
        ];

        REQUIRED_FIELDS
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Derive the idempotency key with priority `payload.call_id > payload.message_id > traceId`.
    pub fn derive_key(&self) -> Result<IdempotencyKey, ValidationError> {
        let from_payload = |field: &str| {
            self.payload
                .as_ref()
                .and_then(|payload| payload.get(field))
                .and_then(key_value)
        };

        if let Some(value) = from_payload("call_id") {
            return Ok(IdempotencyKey {
                value,
                source: KeySource::CallId,
            });
        }
        if let Some(value) = from_payload("message_id") {
            return Ok(IdempotencyKey {
                value,
                source: KeySource::MessageId,
            });
        }
        match non_empty(&self.trace_id) {
            Some(trace_id) => Ok(IdempotencyKey {
                value: trace_id.to_owned(),
                source: KeySource::TraceId,
            }),
            None => Err(ValidationError::NoIdempotencyKey),
        }
    }

    pub fn validate(self) -> Result<ValidatedEnvelope, ValidationError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields(missing));
        }

        let raw_occurred_at = self.occurred_at.clone().unwrap_or_default();
        let occurred_at = parse_timestamp(&raw_occurred_at)
            .ok_or(ValidationError::BadTimestamp(raw_occurred_at))?;

        let idempotency_key = self.derive_key()?;

        // missing_fields() guarantees all of these are set
        Ok(ValidatedEnvelope {
            envelope_version: self.envelope_version.unwrap_or_default(),
            event_type: self.event_type.unwrap_or_default(),
            schema_version: self.schema_version.unwrap_or_default(),
            tenant_id: self.tenant_id.unwrap_or_default(),
            occurred_at,
            trace_id: self.trace_id.filter(|t| !t.trim().is_empty()),
            source: self.source,
            payload: self.payload.unwrap_or_default(),
            idempotency_key,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn key_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an `occurredAt` value. Accepts RFC 3339, a naive ISO-8601 date-time (taken as UTC)
/// or a bare date (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
