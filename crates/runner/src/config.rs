//! Runner configuration loaded from environment variables.

use std::time::Duration;

use saga::{CompensationOptions, SagaConfig, StepExecutionOptions};

/// Runner configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_MAX_RETRIES`: retries after the first attempt (default: `3`)
/// - `SAGA_RETRY_INTERVAL_MS`: first retry delay (default: `5000`)
/// - `SAGA_BACKOFF_COEFFICIENT`: delay growth factor (default: `2.0`)
/// - `SAGA_MAX_RETRY_INTERVAL_MS`: delay cap (default: `60000`)
/// - `SAGA_EVENT_TIMEOUT_MS`: compensation event wait (default: `30000`)
/// - `SAGA_LOG_TTL_SECS`: audit log retention (default: `900`)
/// - `SERVICE_ACK_DELAY_MS`: simulated acknowledgement latency (default: `200`)
/// - `DEMO_CUSTOMER` / `DEMO_CAR_CLASS`: the demo reservation
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `"json"` for JSON logs, anything else for text
///
/// Unparseable values fall back to their default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_retry_interval: Duration,
    pub event_timeout: Duration,
    pub log_ttl: Duration,
    pub ack_delay: Duration,
    pub customer_name: String,
    pub car_class: String,
    pub log_level: String,
    pub json_logs: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map(Duration::from_millis).unwrap_or(default)
        };

        Self {
            max_retries: lookup("SAGA_MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_interval: millis("SAGA_RETRY_INTERVAL_MS", defaults.retry_interval),
            backoff_coefficient: lookup("SAGA_BACKOFF_COEFFICIENT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.backoff_coefficient),
            max_retry_interval: millis("SAGA_MAX_RETRY_INTERVAL_MS", defaults.max_retry_interval),
            event_timeout: millis("SAGA_EVENT_TIMEOUT_MS", defaults.event_timeout),
            log_ttl: parse("SAGA_LOG_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.log_ttl),
            ack_delay: millis("SERVICE_ACK_DELAY_MS", defaults.ack_delay),
            customer_name: lookup("DEMO_CUSTOMER").unwrap_or(defaults.customer_name),
            car_class: lookup("DEMO_CAR_CLASS").unwrap_or(defaults.car_class),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            json_logs: lookup("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        }
    }

    /// Saga options built from this configuration. Validated when the saga
    /// is constructed.
    pub fn saga_config(&self) -> SagaConfig {
        let retry = StepExecutionOptions {
            max_retries: self.max_retries,
            retry_interval: self.retry_interval,
            backoff_coefficient: self.backoff_coefficient,
            max_retry_interval: self.max_retry_interval,
        };
        SagaConfig {
            step: retry.clone(),
            compensation: CompensationOptions {
                retry,
                event_timeout: self.event_timeout,
            },
            log_ttl: self.log_ttl,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let saga = SagaConfig::default();
        Self {
            max_retries: saga.step.max_retries,
            retry_interval: saga.step.retry_interval,
            backoff_coefficient: saga.step.backoff_coefficient,
            max_retry_interval: saga.step.max_retry_interval,
            event_timeout: saga.compensation.event_timeout,
            log_ttl: saga.log_ttl,
            ack_delay: Duration::from_millis(200),
            customer_name: "Alice".to_string(),
            car_class: "Compact".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_coefficient, 2.0);
        assert_eq!(config.max_retry_interval, Duration::from_secs(60));
        assert_eq!(config.event_timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(from_pairs(&[]), Config::default());
    }

    #[test]
    fn test_values_are_read() {
        let config = from_pairs(&[
            ("SAGA_MAX_RETRIES", "5"),
            ("SAGA_RETRY_INTERVAL_MS", "250"),
            ("SAGA_BACKOFF_COEFFICIENT", "1.5"),
            ("SAGA_LOG_TTL_SECS", "60"),
            ("DEMO_CUSTOMER", "Bob"),
            ("LOG_FORMAT", "JSON"),
        ]);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.backoff_coefficient, 1.5);
        assert_eq!(config.log_ttl, Duration::from_secs(60));
        assert_eq!(config.customer_name, "Bob");
        assert!(config.json_logs);
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = from_pairs(&[("SAGA_MAX_RETRIES", "many"), ("SERVICE_ACK_DELAY_MS", "-1")]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ack_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_saga_config_validates() {
        assert!(Config::default().saga_config().validate().is_ok());

        let config = from_pairs(&[("SAGA_BACKOFF_COEFFICIENT", "0.5")]);
        assert!(config.saga_config().validate().is_err());
    }
}
