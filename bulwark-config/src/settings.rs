//! Typed settings for policies, memoizers and logging.
//!
//! Durations are plain integers in milliseconds so the same settings read
//! naturally from TOML, JSON and environment variables:
//!
//! ```toml
//! [policies.payments.timeout]
//! timeout_ms = 2000
//!
//! [policies.payments.retry]
//! max_attempts = 4
//! retry_on = "transient"
//! backoff = { type = "exponential", initial_ms = 50, max_delay_ms = 1000 }
//!
//! [policies.payments.circuit_breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 30000
//!
//! [memoize.exchange_rates]
//! expiration_ms = 60000
//! max_size = 512
//! ```

use crate::validation::{ConfigValidator, Validate};
use crate::{Result, SettingsError};
use bulwark_cache::MemoizeOptions;
use bulwark_core::logging::{LogConfig, LogFormat, LogLevel};
use bulwark_core::{
    Backoff, BulkheadConfig, CircuitBreakerConfig, Error, ResiliencePolicy, RetryConfig,
    TimeoutConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Prefix a validation message with the section it came from.
fn scoped(scope: &str, result: Result<()>) -> Result<()> {
    result.map_err(|e| match e {
        SettingsError::ValidationError(msg) => {
            SettingsError::ValidationError(format!("{}.{}", scope, msg))
        }
        other => other,
    })
}

/// Everything bulwark reads from configuration sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulwarkSettings {
    /// Resilience policies by name
    #[serde(default)]
    pub policies: BTreeMap<String, ResilienceSettings>,

    /// Memoizer options by name
    #[serde(default)]
    pub memoize: BTreeMap<String, MemoizeSettings>,

    #[serde(default)]
    pub logging: Option<LoggingSettings>,
}

impl BulwarkSettings {
    /// Build the policy configured under `name`.
    pub fn policy(&self, name: &str) -> Result<ResiliencePolicy> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| SettingsError::KeyNotFound(format!("policies.{}", name)))?
            .into_policy(name)
    }

    /// Memoizer options configured under `name`.
    pub fn memoize_options<K, V>(&self, name: &str) -> Result<MemoizeOptions<K, V>> {
        self.memoize
            .get(name)
            .ok_or_else(|| SettingsError::KeyNotFound(format!("memoize.{}", name)))?
            .into_options()
    }
}

impl Validate for BulwarkSettings {
    fn validate(&self) -> Result<()> {
        for (name, policy) in &self.policies {
            scoped(&format!("policies.{}", name), policy.validate())?;
        }
        for (name, memoize) in &self.memoize {
            scoped(&format!("memoize.{}", name), memoize.validate())?;
        }
        if let Some(logging) = &self.logging {
            scoped("logging", logging.validate())?;
        }
        Ok(())
    }
}

/// One resilience policy; absent sections are not applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    pub timeout: Option<TimeoutSettings>,
    pub retry: Option<RetrySettings>,
    pub circuit_breaker: Option<CircuitBreakerSettings>,
    pub bulkhead: Option<BulkheadSettings>,
}

impl ResilienceSettings {
    /// Validate and build a policy whose components are named after `name`.
    pub fn into_policy(self, name: &str) -> Result<ResiliencePolicy> {
        scoped(&format!("policies.{}", name), self.validate())?;

        let mut builder = ResiliencePolicy::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.with_timeout(TimeoutConfig::new(ms(timeout.timeout_ms)).with_name(name));
        }
        if let Some(retry) = self.retry {
            builder = builder.with_retry(retry.to_config(name));
        }
        if let Some(breaker) = self.circuit_breaker {
            builder = builder.with_circuit_breaker(
                CircuitBreakerConfig::new(name)
                    .with_failure_threshold(breaker.failure_threshold)
                    .with_reset_timeout(ms(breaker.reset_timeout_ms)),
            );
        }
        if let Some(bulkhead) = self.bulkhead {
            builder = builder.with_bulkhead(
                BulkheadConfig::new(name, bulkhead.max_concurrency)
                    .with_max_queue_size(bulkhead.max_queue_size),
            );
        }

        Ok(builder.build()?)
    }
}

impl Validate for ResilienceSettings {
    fn validate(&self) -> Result<()> {
        if let Some(timeout) = &self.timeout {
            ConfigValidator::positive(timeout.timeout_ms, "timeout.timeout_ms")?;
        }
        if let Some(retry) = &self.retry {
            scoped("retry", retry.validate())?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            ConfigValidator::positive(breaker.failure_threshold, "circuit_breaker.failure_threshold")?;
            ConfigValidator::positive(breaker.reset_timeout_ms, "circuit_breaker.reset_timeout_ms")?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            ConfigValidator::positive(bulkhead.max_concurrency, "bulkhead.max_concurrency")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    pub timeout_ms: u64,
}

/// Which failures a retry policy repeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Every error
    #[default]
    All,
    /// Errors that may clear up on their own, see [`Error::is_transient`]
    Transient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "RetrySettings::default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffSettings,

    /// Deadline applied to each attempt
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry_on: RetryOn,
}

impl RetrySettings {
    fn default_max_attempts() -> u32 {
        3
    }

    fn to_config(&self, name: &str) -> RetryConfig {
        let mut config = RetryConfig::new(self.max_attempts)
            .with_name(name)
            .with_backoff(self.backoff.to_backoff());
        if let Some(attempt_timeout) = self.attempt_timeout_ms {
            config = config.with_timeout(ms(attempt_timeout));
        }
        if self.retry_on == RetryOn::Transient {
            config = config.with_retry_when(Error::is_transient);
        }
        config
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff: BackoffSettings::default(),
            attempt_timeout_ms: None,
            retry_on: RetryOn::default(),
        }
    }
}

impl Validate for RetrySettings {
    fn validate(&self) -> Result<()> {
        ConfigValidator::positive(self.max_attempts, "max_attempts")?;
        if let Some(attempt_timeout) = self.attempt_timeout_ms {
            ConfigValidator::positive(attempt_timeout, "attempt_timeout_ms")?;
        }
        scoped("backoff", self.backoff.validate())
    }
}

/// Delay between retries, tagged by `type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffSettings {
    #[default]
    None,
    Constant {
        delay_ms: u64,
    },
    Linear {
        initial_ms: u64,
        increment_ms: u64,
        #[serde(default)]
        max_delay_ms: Option<u64>,
    },
    Exponential {
        initial_ms: u64,
        #[serde(default = "BackoffSettings::default_multiplier")]
        multiplier: f64,
        #[serde(default)]
        max_delay_ms: Option<u64>,
    },
}

impl BackoffSettings {
    fn default_multiplier() -> f64 {
        2.0
    }

    /// Build the backoff strategy.
    pub fn to_backoff(&self) -> Backoff {
        match *self {
            Self::None => Backoff::None,
            Self::Constant { delay_ms } => Backoff::constant(ms(delay_ms)),
            Self::Linear {
                initial_ms,
                increment_ms,
                max_delay_ms,
            } => {
                let backoff = Backoff::linear(ms(initial_ms), ms(increment_ms));
                match max_delay_ms {
                    Some(max) => backoff.with_max_delay(ms(max)),
                    None => backoff,
                }
            }
            Self::Exponential {
                initial_ms,
                multiplier,
                max_delay_ms,
            } => {
                let backoff = Backoff::exponential(ms(initial_ms)).with_multiplier(multiplier);
                match max_delay_ms {
                    Some(max) => backoff.with_max_delay(ms(max)),
                    None => backoff,
                }
            }
        }
    }
}

impl Validate for BackoffSettings {
    fn validate(&self) -> Result<()> {
        if let Self::Exponential { multiplier, .. } = self {
            ConfigValidator::in_range(*multiplier, 1.0, 100.0, "multiplier")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    #[serde(default = "CircuitBreakerSettings::default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "CircuitBreakerSettings::default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerSettings {
    fn default_failure_threshold() -> u32 {
        5
    }

    fn default_reset_timeout_ms() -> u64 {
        30_000
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            reset_timeout_ms: Self::default_reset_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkheadSettings {
    pub max_concurrency: usize,

    #[serde(default)]
    pub max_queue_size: usize,
}

/// Options of one memoizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoizeSettings {
    pub expiration_ms: Option<u64>,
    pub max_size: Option<usize>,
}

impl MemoizeSettings {
    /// Build validated memoizer options.
    pub fn into_options<K, V>(&self) -> Result<MemoizeOptions<K, V>> {
        self.validate()?;

        let mut options = MemoizeOptions::new();
        if let Some(expiration) = self.expiration_ms {
            options = options.with_expiration(ms(expiration));
        }
        if let Some(max_size) = self.max_size {
            options = options.with_max_size(max_size);
        }
        Ok(options)
    }
}

impl Validate for MemoizeSettings {
    fn validate(&self) -> Result<()> {
        if let Some(expiration) = self.expiration_ms {
            ConfigValidator::positive(expiration, "expiration_ms")?;
        }
        if let Some(max_size) = self.max_size {
            ConfigValidator::positive(max_size, "max_size")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,

    #[serde(default = "LoggingSettings::default_format")]
    pub format: String,

    /// `EnvFilter` directives, overriding `level`
    #[serde(default)]
    pub filter: Option<String>,
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "json".to_string()
    }

    /// Build the logging configuration.
    pub fn to_log_config(&self) -> Result<LogConfig> {
        let mut config = LogConfig::new()
            .level(self.level.parse::<LogLevel>()?)
            .format(self.format.parse::<LogFormat>()?);
        if let Some(filter) = &self.filter {
            config = config.with_env_filter(filter.clone());
        }
        Ok(config)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
            filter: None,
        }
    }
}

impl Validate for LoggingSettings {
    fn validate(&self) -> Result<()> {
        self.to_log_config()?.filter()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: serde_json::Value) -> BulwarkSettings {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_full_policy_from_settings() {
        let settings = settings(json!({
            "policies": {
                "payments": {
                    "timeout": {"timeout_ms": 2000},
                    "retry": {
                        "max_attempts": 4,
                        "retry_on": "transient",
                        "backoff": {"type": "exponential", "initial_ms": 50, "max_delay_ms": 1000}
                    },
                    "circuit_breaker": {"failure_threshold": 3},
                    "bulkhead": {"max_concurrency": 8, "max_queue_size": 16}
                }
            }
        }));

        let policy = settings.policy("payments").unwrap();

        assert_eq!(policy.timeout().map(|t| t.timeout()), Some(Duration::from_secs(2)));
        assert_eq!(policy.retry().map(|r| r.max_attempts()), Some(4));
        let breaker = policy.circuit_breaker().unwrap();
        assert_eq!(breaker.name(), "payments");
        let bulkhead = policy.bulkhead().unwrap();
        assert_eq!(bulkhead.available_permits(), 8);
    }

    #[test]
    fn test_empty_policy() {
        let settings = settings(json!({"policies": {"passthrough": {}}}));
        let policy = settings.policy("passthrough").unwrap();

        assert!(policy.timeout().is_none());
        assert!(policy.retry().is_none());
        assert!(policy.circuit_breaker().is_none());
        assert!(policy.bulkhead().is_none());
    }

    #[test]
    fn test_missing_policy() {
        let settings = BulwarkSettings::default();
        assert!(matches!(
            settings.policy("nope"),
            Err(SettingsError::KeyNotFound(key)) if key == "policies.nope"
        ));
    }

    #[test]
    fn test_section_defaults() {
        let settings = settings(json!({
            "policies": {"db": {"retry": {}, "circuit_breaker": {}}}
        }));
        let db = &settings.policies["db"];

        assert_eq!(db.retry, Some(RetrySettings::default()));
        assert_eq!(db.circuit_breaker, Some(CircuitBreakerSettings::default()));
    }

    #[test]
    fn test_backoff_conversion() {
        let constant = BackoffSettings::Constant { delay_ms: 10 }.to_backoff();
        assert_eq!(constant.delay(3), Duration::from_millis(10));

        let linear = BackoffSettings::Linear {
            initial_ms: 100,
            increment_ms: 50,
            max_delay_ms: Some(180),
        }
        .to_backoff();
        assert_eq!(linear.delay(1), Duration::from_millis(100));
        assert_eq!(linear.delay(2), Duration::from_millis(150));
        assert_eq!(linear.delay(3), Duration::from_millis(180));

        let exponential: BackoffSettings =
            serde_json::from_value(json!({"type": "exponential", "initial_ms": 100})).unwrap();
        assert_eq!(exponential.to_backoff().delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_validation_names_the_field() {
        let settings = settings(json!({
            "policies": {"db": {"retry": {"max_attempts": 0}}}
        }));

        let err = settings.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: policies.db.retry.max_attempts must be greater than zero"
        );
        assert!(settings.policy("db").is_err());
    }

    #[test]
    fn test_invalid_multiplier() {
        let backoff = BackoffSettings::Exponential {
            initial_ms: 10,
            multiplier: 0.5,
            max_delay_ms: None,
        };
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<BulwarkSettings, _> = serde_json::from_value(json!({
            "policies": {"db": {"retry": {"max_attempt": 3}}}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_memoize_options() {
        let settings = settings(json!({
            "memoize": {"rates": {"expiration_ms": 60000, "max_size": 512}}
        }));

        let options: MemoizeOptions<String, f64> = settings.memoize_options("rates").unwrap();
        assert_eq!(options.expiration, Some(Duration::from_secs(60)));
        assert_eq!(options.max_size, Some(512));

        let zero = MemoizeSettings {
            expiration_ms: None,
            max_size: Some(0),
        };
        assert!(zero.into_options::<u8, u8>().is_err());
    }

    #[test]
    fn test_logging_settings() {
        let logging = LoggingSettings {
            level: "debug".to_string(),
            format: "compact".to_string(),
            filter: None,
        };
        assert!(logging.to_log_config().is_ok());

        let invalid = LoggingSettings {
            level: "loud".to_string(),
            ..LoggingSettings::default()
        };
        assert!(matches!(
            invalid.validate(),
            Err(SettingsError::LoggingError(_))
        ));
    }
}
