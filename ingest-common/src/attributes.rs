//! Message attributes used to track replays of dead-lettered envelopes.
use std::collections::HashMap;

use tracing::warn;

pub const REPLAY_ATTEMPTS: &str = "x-replay-attempts";
pub const ORIGINAL_MESSAGE_ID: &str = "x-original-message-id";
pub const REPLAY_TIMESTAMP: &str = "x-replay-timestamp";
pub const PARKED_REASON: &str = "x-parked-reason";
pub const FINAL_ATTEMPT_COUNT: &str = "x-final-attempt-count";
pub const PARKED_TIMESTAMP: &str = "x-parked-timestamp";

/// Attributes with this prefix are set by the queue client library and must not be republished.
pub const TRANSPORT_ATTRIBUTE_PREFIX: &str = "googclient_";

/// Bookkeeping attributes that only make sense while a message is cycling through replays.
pub const REPLAY_BOOKKEEPING: [&str; 2] = [REPLAY_ATTEMPTS, REPLAY_TIMESTAMP];

/// Read the replay attempt counter. Absent means the message was never replayed; a value that
/// does not parse is reported and counted as zero.
pub fn replay_attempts(attributes: &HashMap<String, String>) -> u32 {
    match attributes.get(REPLAY_ATTEMPTS) {
        None => 0,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(value = raw.as_str(), "unparseable {REPLAY_ATTEMPTS} attribute, using 0");
            0
        }),
    }
}

pub fn is_transport_attribute(name: &str) -> bool {
    name.starts_with(TRANSPORT_ATTRIBUTE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_attempts_defaults_to_zero() {
        let mut attributes = HashMap::new();
        assert_eq!(replay_attempts(&attributes), 0);

        attributes.insert(REPLAY_ATTEMPTS.to_string(), "2".to_string());
        assert_eq!(replay_attempts(&attributes), 2);

        attributes.insert(REPLAY_ATTEMPTS.to_string(), "two".to_string());
        assert_eq!(replay_attempts(&attributes), 0);
    }

    #[test]
    fn detects_transport_attributes() {
        assert!(is_transport_attribute("googclient_schemaencoding"));
        assert!(!is_transport_attribute(REPLAY_ATTEMPTS));
    }
}
