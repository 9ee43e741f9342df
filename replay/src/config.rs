use envconfig::Envconfig;
use ingest_common::config::{EnvMsDuration, NonEmptyString};
use tracing::Level;

use crate::coordinator::ReplaySettings;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub pubsub: PubSubConfig,

    pub dead_letter_subscription: NonEmptyString,

    // Where replayed envelopes are republished, the topic the push subscription reads from
    pub ingestion_topic: NonEmptyString,

    // Where envelopes that exhausted their replays are parked for manual review
    pub parking_topic: NonEmptyString,

    #[envconfig(default = "100")]
    pub replay_batch_size: usize,

    // Pause after each republished message, to throttle the replay rate. A pull is acknowledged
    // after its last message, so batch size times delay must stay under the ack deadline
    #[envconfig(default = "20")]
    pub replay_delay_ms: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_replay_attempts: u32,

    // Upper bound on pulls per drain, so a queue fed faster than it drains cannot keep us busy
    #[envconfig(default = "10")]
    pub max_pulls: usize,

    #[envconfig(default = "60")]
    pub replay_interval_secs: u64,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

#[derive(Envconfig, Clone)]
pub struct PubSubConfig {
    #[envconfig(default = "https://pubsub.googleapis.com")]
    pub pubsub_url: String,

    pub pubsub_project: NonEmptyString,

    pub pubsub_auth_token: Option<String>,

    #[envconfig(default = "10000")]
    pub pubsub_timeout_ms: EnvMsDuration,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn replay_settings(&self) -> ReplaySettings {
        ReplaySettings {
            batch_size: self.replay_batch_size.max(1),
            delay: self.replay_delay_ms.0,
            max_attempts: self.max_replay_attempts,
            max_pulls: self.max_pulls.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loads_defaults() {
        let config = Config::init_from_hashmap(&env(&[
            ("PUBSUB_PROJECT", "proj"),
            ("DEAD_LETTER_SUBSCRIPTION", "ingest-dlq"),
            ("INGESTION_TOPIC", "ingest"),
            ("PARKING_TOPIC", "ingest-parked"),
        ]))
        .expect("config should load");

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.pubsub.pubsub_url, "https://pubsub.googleapis.com");
        assert_eq!(
            config.replay_settings(),
            ReplaySettings {
                batch_size: 100,
                delay: Duration::from_millis(20),
                max_attempts: 3,
                max_pulls: 10,
            }
        );
        assert_eq!(config.replay_interval_secs, 60);

        // One pull is throttled well within the subscription's default 10s ack deadline
        let settings = config.replay_settings();
        assert!(settings.delay * settings.batch_size as u32 <= Duration::from_secs(2));
    }

    #[test]
    fn requires_topics() {
        let result = Config::init_from_hashmap(&env(&[
            ("PUBSUB_PROJECT", "proj"),
            ("DEAD_LETTER_SUBSCRIPTION", "ingest-dlq"),
            ("INGESTION_TOPIC", ""),
            ("PARKING_TOPIC", "ingest-parked"),
        ]));
        assert!(result.is_err());
    }
}
