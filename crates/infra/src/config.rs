//! Configuration loading and representation.
//!
//! Every tunable has a default; `ORDERFLOW_*` environment variables override them.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use orderflow_pipeline::{DispatcherConfig, RetryPolicy};

pub const ENV_REDIS_URL: &str = "ORDERFLOW_REDIS_URL";
pub const ENV_ORDERS_STREAM: &str = "ORDERFLOW_ORDERS_STREAM";
pub const ENV_DEAD_LETTER_STREAM: &str = "ORDERFLOW_DLQ_STREAM";
pub const ENV_CONSUMER_GROUP: &str = "ORDERFLOW_CONSUMER_GROUP";
pub const ENV_CONSUMER_NAME: &str = "ORDERFLOW_CONSUMER_NAME";
pub const ENV_MAX_RETRIES: &str = "ORDERFLOW_MAX_RETRIES";
pub const ENV_RETRY_BACKOFF_MS: &str = "ORDERFLOW_RETRY_BACKOFF_MS";
pub const ENV_POLL_TIMEOUT_MS: &str = "ORDERFLOW_POLL_TIMEOUT_MS";
pub const ENV_MAX_POLL_RECORDS: &str = "ORDERFLOW_MAX_POLL_RECORDS";
pub const ENV_REPORT_EVERY: &str = "ORDERFLOW_REPORT_EVERY";
pub const ENV_PARTITIONS: &str = "ORDERFLOW_PARTITIONS";
pub const ENV_MAX_TRANSPORT_FAILURES: &str = "ORDERFLOW_MAX_TRANSPORT_FAILURES";
pub const ENV_FAILURE_RATE: &str = "ORDERFLOW_FAILURE_RATE";
pub const ENV_WORK_MS: &str = "ORDERFLOW_WORK_MS";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Pipeline configuration shared by the consumer and the producer.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub redis_url: String,
    pub orders_stream: String,
    pub dead_letter_stream: String,
    pub consumer_group: String,
    /// Base consumer name; worker `i` uses `{consumer_name}-{i}`
    pub consumer_name: String,
    /// Total attempts per order before it is dead-lettered
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub poll_timeout: Duration,
    pub max_poll_records: usize,
    /// Successful orders between periodic statistics reports
    pub report_every: u64,
    pub partitions: u32,
    /// 0 = keep retrying the transport forever
    pub max_consecutive_transport_failures: u32,
    /// Failure probability of the simulated processing step
    pub failure_rate: f64,
    /// Work time of the simulated processing step
    pub work_time: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            orders_stream: "orders".to_string(),
            dead_letter_stream: "orders-dlq".to_string(),
            consumer_group: "order-consumer-group".to_string(),
            consumer_name: "order-consumer".to_string(),
            max_retries: 3,
            retry_backoff: Duration::from_millis(2_000),
            poll_timeout: Duration::from_millis(1_000),
            max_poll_records: 100,
            report_every: 10,
            partitions: 1,
            max_consecutive_transport_failures: 10,
            failure_rate: 0.1,
            work_time: Duration::from_millis(50),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by the process environment, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `ORDERFLOW_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_REDIS_URL) {
            config.redis_url = v;
        }
        if let Some(v) = lookup(ENV_ORDERS_STREAM) {
            config.orders_stream = v;
        }
        if let Some(v) = lookup(ENV_DEAD_LETTER_STREAM) {
            config.dead_letter_stream = v;
        }
        if let Some(v) = lookup(ENV_CONSUMER_GROUP) {
            config.consumer_group = v;
        }
        if let Some(v) = lookup(ENV_CONSUMER_NAME) {
            config.consumer_name = v;
        }
        if let Some(v) = parsed(&lookup, ENV_MAX_RETRIES)? {
            config.max_retries = v;
        }
        if let Some(ms) = parsed(&lookup, ENV_RETRY_BACKOFF_MS)? {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed(&lookup, ENV_POLL_TIMEOUT_MS)? {
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parsed(&lookup, ENV_MAX_POLL_RECORDS)? {
            config.max_poll_records = v;
        }
        if let Some(v) = parsed(&lookup, ENV_REPORT_EVERY)? {
            config.report_every = v;
        }
        if let Some(v) = parsed(&lookup, ENV_PARTITIONS)? {
            config.partitions = v;
        }
        if let Some(v) = parsed(&lookup, ENV_MAX_TRANSPORT_FAILURES)? {
            config.max_consecutive_transport_failures = v;
        }
        if let Some(v) = parsed(&lookup, ENV_FAILURE_RATE)? {
            config.failure_rate = v;
        }
        if let Some(ms) = parsed(&lookup, ENV_WORK_MS)? {
            config.work_time = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Validation(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError::Validation(
                "max_poll_records must be at least 1".to_string(),
            ));
        }
        if self.partitions == 0 {
            return Err(ConfigError::Validation(
                "partitions must be at least 1".to_string(),
            ));
        }
        if self.report_every == 0 {
            return Err(ConfigError::Validation(
                "report_every must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::Validation(format!(
                "failure_rate must be within [0, 1], got {}",
                self.failure_rate
            )));
        }
        if self.orders_stream.trim().is_empty() || self.dead_letter_stream.trim().is_empty() {
            return Err(ConfigError::Validation(
                "stream names must not be empty".to_string(),
            ));
        }
        if self.orders_stream == self.dead_letter_stream {
            return Err(ConfigError::Validation(format!(
                "dead-letter stream must differ from the orders stream ({})",
                self.orders_stream
            )));
        }
        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_streams(
        mut self,
        orders: impl Into<String>,
        dead_letter: impl Into<String>,
    ) -> Self {
        self.orders_stream = orders.into();
        self.dead_letter_stream = dead_letter.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, self.retry_backoff)
    }

    /// Dispatcher settings for the worker called `name`.
    pub fn dispatcher_config(&self, name: impl Into<String>) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name(name)
            .with_poll_timeout(self.poll_timeout)
            .with_retry_policy(self.retry_policy())
            .with_max_consecutive_transport_failures(self.max_consecutive_transport_failures)
    }

    /// Consumer name for worker `index`.
    pub fn worker_consumer_name(&self, index: u32) -> String {
        format!("{}-{index}", self.consumer_name)
    }
}

fn parsed<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff, Duration::from_secs(2));
        assert_eq!(config.orders_stream, "orders");
        assert_eq!(config.dead_letter_stream, "orders-dlq");
        assert_eq!(config.consumer_group, "order-consumer-group");
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[
            (ENV_REDIS_URL, "redis://cache:6380"),
            (ENV_MAX_RETRIES, "5"),
            (ENV_RETRY_BACKOFF_MS, " 250 "),
            (ENV_PARTITIONS, "4"),
            (ENV_FAILURE_RATE, "0.5"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff, Duration::from_millis(250));
        assert_eq!(config.partitions, 4);
        assert_eq!(config.failure_rate, 0.5);
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let err = PipelineConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "three")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: ENV_MAX_RETRIES, .. }
        ));
    }

    #[test]
    fn zero_retries_are_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn dead_letter_stream_must_differ() {
        let config = PipelineConfig::default().with_streams("orders", "orders");
        assert!(config.validate().is_err());
    }

    #[test]
    fn failure_rate_must_be_a_probability() {
        let err = PipelineConfig::from_lookup(lookup(&[(ENV_FAILURE_RATE, "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn dispatcher_config_carries_retry_settings() {
        let config = PipelineConfig::default()
            .with_max_retries(4)
            .with_retry_backoff(Duration::from_millis(10));
        let dispatcher = config.dispatcher_config("worker-0");

        assert_eq!(dispatcher.name, "worker-0");
        assert_eq!(dispatcher.retry.max_retries, 4);
        assert_eq!(dispatcher.retry.backoff, Duration::from_millis(10));
        assert_eq!(dispatcher.max_consecutive_transport_failures, 10);
        assert_eq!(config.worker_consumer_name(2), "order-consumer-2");
    }
}
