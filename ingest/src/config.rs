use std::net::SocketAddr;

use envconfig::Envconfig;
use ingest_common::config::{CommaSeparated, EnvMsDuration};
use thiserror::Error;
use tracing::Level;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("SAMPLING_RATE must be a number between 0.0 and 1.0, got {0}")]
    InvalidSamplingRate(f64),
    #[error("{0} must be set unless PRINT_SINK is enabled")]
    MissingSinkSetting(&'static str),
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    // 1.0 keeps every event
    #[envconfig(default = "1.0")]
    pub sampling_rate: f64,

    #[envconfig(nested = true)]
    pub batch: BatchConfig,

    // How long a push request waits for its batch to be written before answering 503
    #[envconfig(default = "30000")]
    pub ingest_wait_timeout_ms: EnvMsDuration,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(nested = true)]
    pub sink: SinkConfig,

    #[envconfig(nested = true)]
    pub normalize: NormalizeConfig,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

#[derive(Envconfig, Clone)]
pub struct BatchConfig {
    // 1 disables batching
    #[envconfig(default = "1")]
    pub batch_max_size: usize,
    #[envconfig(default = "0")]
    pub batch_max_wait_ms: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct SinkConfig {
    #[envconfig(default = "https://bigquery.googleapis.com/bigquery/v2")]
    pub sink_url: String,
    pub sink_project: Option<String>,
    #[envconfig(default = "events")]
    pub sink_dataset: String,
    #[envconfig(default = "events")]
    pub sink_table: String,
    pub sink_auth_token: Option<String>,
    #[envconfig(default = "10000")]
    pub sink_timeout_ms: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct NormalizeConfig {
    #[envconfig(default = "phone,phone_number,from,to,caller,callee")]
    pub normalize_phone_fields: CommaSeparated,
    #[envconfig(default = "1")]
    pub normalize_default_country_code: String,
}

impl Config {
    /// Cross-field checks envconfig cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::InvalidSamplingRate(self.sampling_rate));
        }
        if !self.print_sink && self.sink.sink_project.is_none() {
            return Err(ConfigError::MissingSinkSetting("SINK_PROJECT"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).expect("failed to load config")
    }

    #[test]
    fn defaults_disable_batching_and_keep_everything() {
        let config = config_from(&[("PRINT_SINK", "true")]);

        assert_eq!(config.sampling_rate, 1.0);
        assert_eq!(config.batch.batch_max_size, 1);
        assert!(config.batch.batch_max_wait_ms.0.is_zero());
        assert_eq!(
            config.normalize.normalize_phone_fields.0,
            vec!["phone", "phone_number", "from", "to", "caller", "callee"]
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_sampling_rate() {
        for rate in ["1.5", "-0.1", "NaN"] {
            let config = config_from(&[("PRINT_SINK", "true"), ("SAMPLING_RATE", rate)]);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidSamplingRate(_))
            ));
        }
    }

    #[test]
    fn requires_sink_project_for_real_sink() {
        let config = config_from(&[]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingSinkSetting("SINK_PROJECT"))
        );

        let config = config_from(&[("SINK_PROJECT", "analytics")]);
        assert_eq!(config.validate(), Ok(()));
    }
}
