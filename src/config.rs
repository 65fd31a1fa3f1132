//! Construction settings for every primitive, loadable from JSON.
//!
//! Durations are whole milliseconds. Omitted fields take the defaults documented on each
//! field. `validate()` reports the first problem found; constructors call it, so an invalid
//! record never produces a half-built primitive.

use crate::backoff::Backoff;
use crate::rate_limit::{validate_quota, LimiterKind};
use crate::ConfigError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse any config record from JSON.
pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T, ConfigError> {
    serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_failure_threshold() -> usize {
    5
}

fn default_reset_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_scale_up() -> f64 {
    1.1
}

fn default_scale_down() -> f64 {
    0.9
}

fn default_key_prefix() -> String {
    crate::rate_limit::distributed::DEFAULT_KEY_PREFIX.to_string()
}

/// Rate limiter settings: `rate` requests per `window_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub algorithm: LimiterKind,
    pub rate: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Token bucket capacity (0 means `rate`), or extra requests per fixed window.
    #[serde(default)]
    pub burst_size: u64,
    /// Only read by the distributed algorithm.
    #[serde(default)]
    pub distributed: Option<DistributedConfig>,
    /// Required by the adaptive algorithm.
    #[serde(default)]
    pub adaptive: Option<AdaptiveConfig>,
}

impl LimiterConfig {
    pub fn new(algorithm: LimiterKind, rate: u64, window: Duration) -> Self {
        Self {
            algorithm,
            rate,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            burst_size: 0,
            distributed: None,
            adaptive: None,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.algorithm == LimiterKind::Adaptive {
            return self.adaptive.as_ref().ok_or(ConfigError::MissingAdaptiveSettings)?.validate();
        }
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if self.window_ms == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.algorithm == LimiterKind::FixedWindow {
            return validate_quota(self.rate.saturating_add(self.burst_size));
        }
        validate_quota(self.rate.max(self.burst_size))
    }
}

/// Where the distributed limiter keeps its keys. The store itself is injected in code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self { key_prefix: default_key_prefix() }
    }
}

/// Bounds and tuning for the adaptive limiter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub initial_limit: u64,
    pub min_limit: u64,
    pub max_limit: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// How often the limit may move. Defaults to one window.
    #[serde(default = "default_window_ms")]
    pub adjust_interval_ms: u64,
    /// Growth factor under low load.
    #[serde(default = "default_scale_up")]
    pub scale_up: f64,
    /// Shrink factor under high load.
    #[serde(default = "default_scale_down")]
    pub scale_down: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_limit: 100,
            min_limit: 10,
            max_limit: 1_000,
            window_ms: default_window_ms(),
            adjust_interval_ms: default_window_ms(),
            scale_up: default_scale_up(),
            scale_down: default_scale_down(),
        }
    }
}

impl AdaptiveConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max, initial) = (self.min_limit, self.max_limit, self.initial_limit);
        if min == 0 || min > max || initial < min || initial > max {
            return Err(ConfigError::InvalidAdaptiveBounds { min, max, initial });
        }
        validate_quota(max)?;
        if self.window_ms == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.adjust_interval_ms == 0 {
            return Err(ConfigError::InvalidFactor { name: "adjust_interval_ms", value: 0.0 });
        }
        if !self.scale_up.is_finite() || self.scale_up < 1.0 {
            return Err(ConfigError::InvalidFactor { name: "scale_up", value: self.scale_up });
        }
        if !self.scale_down.is_finite() || self.scale_down <= 0.0 || self.scale_down > 1.0 {
            return Err(ConfigError::InvalidFactor { name: "scale_down", value: self.scale_down });
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Resource name reported in errors and events. Empty means "use the composite resource".
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.reset_timeout_ms == 0 {
            return Err(ConfigError::InvalidResetTimeout(Duration::ZERO));
        }
        Ok(())
    }
}

/// Bulkhead settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadConfig {
    #[serde(default)]
    pub name: String,
    pub max_concurrent: usize,
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroCapacity { what: "bulkhead" });
        }
        Ok(())
    }
}

/// Retry settings; the delay before attempt `n + 1` is
/// `min(initial_interval * multiplier^(n - 1), max_interval)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        Backoff::new(
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            self.multiplier,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        self.backoff().map(|_| ())
    }
}

/// Settings for a whole [`CompositeExecutor`](crate::composite::CompositeExecutor). Absent
/// stages are skipped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeConfig {
    /// Name used in events and as the default rate limit identity.
    pub resource: String,
    #[serde(default)]
    pub limiter: Option<LimiterConfig>,
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,
    #[serde(default)]
    pub bulkhead: Option<BulkheadConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl CompositeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = from_json(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limiter) = &self.limiter {
            limiter.validate()?;
        }
        if let Some(breaker) = &self.breaker {
            breaker.validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let breaker: BreakerConfig = from_json("{}").unwrap();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout(), Duration::from_secs(10));

        let retry: RetryConfig = from_json("{}").unwrap();
        assert_eq!(retry, RetryConfig::default());
        let backoff = retry.backoff().unwrap();
        assert_eq!(backoff.initial(), Duration::from_secs(1));
        assert_eq!(backoff.max(), Duration::from_secs(30));
        assert_eq!(backoff.multiplier(), 2.0);
    }

    #[test]
    fn limiter_config_parses_algorithm_names() {
        let config: LimiterConfig =
            from_json(r#"{"algorithm": "sliding_window", "rate": 100, "window_ms": 60000}"#).unwrap();
        assert_eq!(config.algorithm, LimiterKind::SlidingWindow);
        assert_eq!(config.window(), Duration::from_secs(60));
        assert_eq!(config.burst_size, 0);

        let config: LimiterConfig = from_json(r#"{"rate": 5}"#).unwrap();
        assert_eq!(config.algorithm, LimiterKind::TokenBucket);
        assert_eq!(config.window(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_rate = LimiterConfig::new(LimiterKind::TokenBucket, 0, Duration::from_secs(1));
        assert_eq!(zero_rate.validate(), Err(ConfigError::ZeroRate));

        let zero_window = LimiterConfig::new(LimiterKind::FixedWindow, 1, Duration::ZERO);
        assert_eq!(zero_window.validate(), Err(ConfigError::ZeroWindow));

        let adaptive = LimiterConfig::new(LimiterKind::Adaptive, 1, Duration::from_secs(1));
        assert_eq!(adaptive.validate(), Err(ConfigError::MissingAdaptiveSettings));

        let breaker = BreakerConfig { failure_threshold: 0, ..BreakerConfig::default() };
        assert!(matches!(breaker.validate(), Err(ConfigError::InvalidFailureThreshold { .. })));

        let retry = RetryConfig { multiplier: 0.5, ..RetryConfig::default() };
        assert!(matches!(retry.validate(), Err(ConfigError::InvalidMultiplier(_))));

        let retry = RetryConfig { max_interval_ms: 10, ..RetryConfig::default() };
        assert!(matches!(retry.validate(), Err(ConfigError::InvalidInterval { .. })));
    }

    #[test]
    fn adaptive_bounds_are_checked() {
        let ok = AdaptiveConfig::default();
        assert!(ok.validate().is_ok());

        let inverted = AdaptiveConfig { min_limit: 50, max_limit: 10, ..ok.clone() };
        assert!(matches!(inverted.validate(), Err(ConfigError::InvalidAdaptiveBounds { .. })));

        let shrink_up = AdaptiveConfig { scale_down: 1.5, ..ok };
        assert_eq!(
            shrink_up.validate(),
            Err(ConfigError::InvalidFactor { name: "scale_down", value: 1.5 })
        );
    }

    #[test]
    fn composite_config_round_trips_through_json() {
        let json = r#"{
            "resource": "payments",
            "limiter": {"rate": 10, "burst_size": 2},
            "breaker": {"failure_threshold": 3},
            "bulkhead": {"max_concurrent": 4},
            "retry": {"max_attempts": 2, "initial_interval_ms": 50}
        }"#;
        let config = CompositeConfig::from_json(json).unwrap();
        assert_eq!(config.resource, "payments");
        assert_eq!(config.bulkhead.as_ref().unwrap().max_concurrent, 4);

        let back = serde_json::to_string(&config).unwrap();
        assert_eq!(CompositeConfig::from_json(&back).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = CompositeConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = CompositeConfig::from_json(r#"{"resource": "x", "bulkhead": {"max_concurrent": 0}}"#)
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroCapacity { what: "bulkhead" });
    }
}
