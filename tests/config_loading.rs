use floodgate::config::{from_json, AdaptiveConfig, LimiterConfig, RetryConfig};
use floodgate::rate_limit::{build_limiter, SlidingWindow, TokenBucket, MAX_RATE};
use floodgate::telemetry::NullSink;
use floodgate::{CompositeConfig, CompositeExecutor, ConfigError, LimiterKind, RateLimiter};
use std::time::Duration;

#[test]
fn limiter_defaults_fill_missing_fields() {
    let config: LimiterConfig = from_json(r#"{"rate": 50}"#).unwrap();
    assert_eq!(config.algorithm, LimiterKind::TokenBucket);
    assert_eq!(config.window(), Duration::from_secs(1));
    assert_eq!(config.burst_size, 0);
    assert!(config.distributed.is_none());
}

#[test]
fn unknown_algorithm_is_a_parse_error() {
    let err = from_json::<LimiterConfig>(r#"{"algorithm": "leaky_bucket", "rate": 1}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(msg) if msg.contains("leaky_bucket")));
}

#[test]
fn invalid_values_are_rejected_when_building() {
    let zero_rate = LimiterConfig::new(LimiterKind::SlidingWindow, 0, Duration::from_secs(1));
    assert_eq!(build_limiter(&zero_rate, None).unwrap_err(), ConfigError::ZeroRate);

    let adaptive = LimiterConfig::new(LimiterKind::Adaptive, 10, Duration::from_secs(1));
    assert_eq!(build_limiter(&adaptive, None).unwrap_err(), ConfigError::MissingAdaptiveSettings);

    let retry: RetryConfig = from_json(r#"{"multiplier": 0.5}"#).unwrap();
    assert!(matches!(retry.validate(), Err(ConfigError::InvalidMultiplier(m)) if m == 0.5));
}

#[test]
fn composite_config_rejects_bad_stages() {
    let err = CompositeConfig::from_json(
        r#"{"resource": "payments", "breaker": {"failure_threshold": 0}}"#,
    )
    .unwrap_err();
    assert_eq!(err, ConfigError::InvalidFailureThreshold { provided: 0 });

    let err = CompositeConfig::from_json(
        r#"{"resource": "payments", "retry": {"initial_interval_ms": 500, "max_interval_ms": 100}}"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidInterval { .. }));
}

#[test]
fn adaptive_composite_from_json() {
    let config = CompositeConfig::from_json(
        r#"{
            "resource": "search",
            "limiter": {
                "algorithm": "adaptive",
                "rate": 40,
                "adaptive": {"initial_limit": 40, "min_limit": 10, "max_limit": 80}
            },
            "retry": {"max_attempts": 2}
        }"#,
    )
    .unwrap();
    let executor = CompositeExecutor::<std::io::Error, _>::from_config(&config, None, NullSink).unwrap();
    let stats = executor.stats();
    assert_eq!(stats.rate_limiter.unwrap().limit, 40);
    assert!(stats.circuit_breaker.is_none());
    assert!(stats.bulkhead.is_none());
    assert_eq!(stats.retry.unwrap().executions, 0);
}

#[test]
fn config_round_trips_through_serde() {
    let config = CompositeConfig::from_json(
        r#"{"resource": "a", "bulkhead": {"name": "pool", "max_concurrent": 2}}"#,
    )
    .unwrap();
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(CompositeConfig::from_json(&json).unwrap(), config);
}

#[tokio::test]
async fn quotas_beyond_the_signed_range_are_rejected() {
    let too_large = ConfigError::RateTooLarge { provided: u64::MAX, max: MAX_RATE };
    for kind in [LimiterKind::TokenBucket, LimiterKind::SlidingWindow, LimiterKind::FixedWindow] {
        let config = LimiterConfig::new(kind, u64::MAX, Duration::from_secs(1));
        assert_eq!(build_limiter(&config, None).unwrap_err(), too_large, "{kind:?}");
    }
    assert_eq!(SlidingWindow::new(u64::MAX, Duration::from_secs(1)).unwrap_err(), too_large);
    assert_eq!(TokenBucket::new(1, Duration::from_secs(1), u64::MAX).unwrap_err(), too_large);

    let adaptive = AdaptiveConfig { initial_limit: 1, min_limit: 1, max_limit: u64::MAX, ..AdaptiveConfig::default() };
    assert_eq!(adaptive.validate().unwrap_err(), too_large);

    let widest = SlidingWindow::new(MAX_RATE, Duration::from_secs(1)).unwrap();
    assert_eq!(widest.remaining("a").await, i64::MAX);
}
