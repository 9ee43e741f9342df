use ingest_common::envelope::ValidatedEnvelope;
use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::debug;

const SAMPLING_DECISIONS_TOTAL: &str = "ingest_sampling_decisions_total";

// Largest value of a 60 bit (15 hex digit) digest prefix
const LONG_SCALE: u64 = 0xfffffffffffffff;

/// Map a key to a float in [0, 1]. The same key always maps to the same value, on any host,
/// and values are uniformly distributed, so `hash_fraction(key) < 0.2` keeps 20% of keys.
pub fn hash_fraction(key: &str) -> f64 {
    let digest = Sha256::digest(key.as_bytes());

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    // Keep the first 15 hex digits of the digest
    let hash_val = u64::from_be_bytes(prefix) >> 4;

    hash_val as f64 / LONG_SCALE as f64
}

/// Deterministic keep/drop decision for an idempotency key.
pub fn should_sample(key: &str, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 || rate.is_nan() {
        return false;
    }
    hash_fraction(key) < rate
}

#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    rate: f64,
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        Self { rate }
    }

    /// Decide whether to keep an event, recording the decision and its inputs for audit.
    pub fn keep(&self, envelope: &ValidatedEnvelope) -> bool {
        let keep = should_sample(envelope.key(), self.rate);

        debug!(
            idempotency_key = envelope.key(),
            tenant_id = envelope.tenant_id.as_str(),
            event_type = envelope.event_type.as_str(),
            rate = self.rate,
            keep,
            "sampling decision"
        );
        let decision = if keep { "keep" } else { "drop" };
        counter!(SAMPLING_DECISIONS_TOTAL, "decision" => decision).increment(1);

        keep
    }
}
