//! Service configuration.

use std::{net::SocketAddr, path::Path, time::Duration};

use jitter_config::{ConfigurationError, ConfigurationLoader};
use jitter_core::{distribution::Distribution, latency::LatencySimulator};
use jitter_error::{generic_error, GenericError};
use serde::Deserialize;

/// Prefix for environment variables that override configuration values.
pub const ENV_PREFIX: &str = "JITTER";

/// Service configuration.
///
/// Every field has a default, so an empty configuration is valid.
#[derive(Clone, Debug, Deserialize)]
pub struct JitterConfiguration {
    /// Address to listen for HTTP requests on.
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// How long a client has to send request headers, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// How long a request has to produce a response before its connection is closed, in seconds.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// How long in-flight requests are given to finish once shutdown begins, in seconds.
    #[serde(default = "default_shutdown_grace_period_secs")]
    pub shutdown_grace_period_secs: u64,

    /// How long abandoned requests are given to write a response after the grace period, in milliseconds.
    #[serde(default = "default_abandon_drain_period_ms")]
    pub abandon_drain_period_ms: u64,

    /// Exclusive upper bound of simulated latency, in milliseconds.
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,

    /// Status codes to respond with, and their relative weights.
    #[serde(default)]
    pub outcomes: Distribution,

    /// Seed for the random number generator.
    ///
    /// When unset, the generator is seeded from the operating system.
    #[serde(default)]
    pub rng_seed: Option<u64>,

    /// How often collected metrics are flushed, in seconds.
    #[serde(default = "default_telemetry_flush_interval_secs")]
    pub telemetry_flush_interval_secs: u64,

    /// Prefix prepended to all metric names.
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

const fn default_read_timeout_secs() -> u64 {
    1
}

const fn default_write_timeout_secs() -> u64 {
    10
}

const fn default_shutdown_grace_period_secs() -> u64 {
    5
}

const fn default_abandon_drain_period_ms() -> u64 {
    500
}

const fn default_max_latency_ms() -> u64 {
    2000
}

const fn default_telemetry_flush_interval_secs() -> u64 {
    10
}

fn default_metrics_prefix() -> String {
    "jitter".to_string()
}

impl JitterConfiguration {
    /// Loads the configuration.
    ///
    /// Values are taken, in increasing order of precedence, from the built-in defaults, the YAML file at
    /// `config_path` (if given), and `JITTER_`-prefixed environment variables.
    ///
    /// # Errors
    ///
    /// If the configuration file cannot be read, or any value is invalid, an error is returned.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut loader = ConfigurationLoader::default();
        if let Some(config_path) = config_path {
            loader = loader.from_yaml(config_path)?;
        }

        loader.from_environment(ENV_PREFIX)?.into_typed()
    }

    /// Validates the configuration, ensuring that all settings can be served.
    ///
    /// # Errors
    ///
    /// If any configured outcome has a status code outside of `100..=599`, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        if let Some(outcome) = self
            .outcomes
            .outcomes()
            .iter()
            .find(|outcome| !(100..=599).contains(&outcome.code()))
        {
            return Err(generic_error!(
                "Invalid status code {} in configured outcomes: must be between 100 and 599.",
                outcome.code()
            ));
        }

        Ok(())
    }

    /// Returns the HTTP/1 header read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Returns the per-request response timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Returns the shutdown grace period.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Returns the abandoned request drain period.
    pub fn abandon_drain_period(&self) -> Duration {
        Duration::from_millis(self.abandon_drain_period_ms)
    }

    /// Returns the telemetry flush interval.
    pub fn telemetry_flush_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_flush_interval_secs)
    }

    /// Returns the latency simulator described by this configuration.
    pub fn latency_simulator(&self) -> LatencySimulator {
        LatencySimulator::from_max_millis(self.max_latency_ms)
    }
}

impl Default for JitterConfiguration {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            shutdown_grace_period_secs: default_shutdown_grace_period_secs(),
            abandon_drain_period_ms: default_abandon_drain_period_ms(),
            max_latency_ms: default_max_latency_ms(),
            outcomes: Distribution::default(),
            rng_seed: None,
            telemetry_flush_interval_secs: default_telemetry_flush_interval_secs(),
            metrics_prefix: default_metrics_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use jitter_core::distribution::Outcome;

    use super::*;

    #[test]
    fn defaults() {
        Jail::expect_with(|_| {
            let config = JitterConfiguration::load(None).map_err(|e| e.to_string())?;

            assert_eq!(config.listen_address, "0.0.0.0:8080".parse().unwrap());
            assert_eq!(config.read_timeout(), Duration::from_secs(1));
            assert_eq!(config.write_timeout(), Duration::from_secs(10));
            assert_eq!(config.shutdown_grace_period(), Duration::from_secs(5));
            assert_eq!(config.abandon_drain_period(), Duration::from_millis(500));
            assert_eq!(config.latency_simulator().max_millis(), 2000);
            assert_eq!(config.outcomes, Distribution::default());
            assert_eq!(config.rng_seed, None);
            assert_eq!(config.metrics_prefix, "jitter");
            Ok(())
        });
    }

    #[test]
    fn file_and_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "jitter.yaml",
                r#"
listen_address: "127.0.0.1:9090"
max_latency_ms: 250
rng_seed: 42
outcomes:
  - code: 200
    weight: 1
  - code: 503
    weight: 3
"#,
            )?;
            jail.set_env("JITTER_MAX_LATENCY_MS", "50");

            let config = JitterConfiguration::load(Some(Path::new("jitter.yaml"))).map_err(|e| e.to_string())?;

            assert_eq!(config.listen_address, "127.0.0.1:9090".parse().unwrap());
            assert_eq!(config.max_latency_ms, 50);
            assert_eq!(config.rng_seed, Some(42));
            assert_eq!(config.outcomes.outcomes(), &[Outcome::new(200, 1), Outcome::new(503, 3)]);
            Ok(())
        });
    }

    #[test]
    fn zero_weights_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "jitter.yaml",
                "outcomes:\n  - code: 200\n    weight: 0\n  - code: 500\n    weight: 0\n",
            )?;

            let result = JitterConfiguration::load(Some(Path::new("jitter.yaml")));
            assert!(result.is_err());
            Ok(())
        });
    }

    #[test]
    fn invalid_status_code_rejected() {
        let mut config = JitterConfiguration::default();
        assert!(config.validate().is_ok());

        config.outcomes = Distribution::try_from_outcomes(vec![Outcome::new(200, 1), Outcome::new(42, 1)]).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn missing_file_rejected() {
        Jail::expect_with(|_| {
            let result = JitterConfiguration::load(Some(Path::new("missing.yaml")));
            assert!(matches!(result, Err(ConfigurationError::Source { .. })));
            Ok(())
        });
    }
}
