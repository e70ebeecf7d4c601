//! Engine configuration.
//!
//! [`EngineConfig`] is a plain struct with defaults for every knob. It can
//! also be loaded from TOML, where every field is optional, and the webhook
//! secret can be supplied through `SITESYNC_WEBHOOK_SECRET` instead of the
//! file.
//!
//! ```toml
//! webhook_secret = "change-me"
//!
//! [dispatch]
//! max_in_flight = 10
//! tick_secs = 1
//!
//! [retry]
//! max_retries = 8
//! base_delays_secs = [1, 2, 4, 8, 16, 32, 64, 128]
//!
//! [polling]
//! interval_secs = 60
//! max_failures = 10
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use sitesync_core::{PollingPolicy, RetryPolicy};
use sitesync_delivery::{DispatchConfig, HttpConfig, SigningSecret};

use crate::detector::DetectorConfig;
use crate::error::ConfigError;
use crate::metrics::MetricsConfig;
use crate::reconciler::PollingConfig;

/// Environment variable that overrides the webhook secret.
pub const SECRET_ENV: &str = "SITESYNC_WEBHOOK_SECRET";

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HMAC key for outbound webhook signatures.
    pub webhook_secret: SigningSecret,
    pub dispatch: DispatchConfig,
    /// How often the dispatch worker looks for due events without a wake-up.
    pub dispatch_tick: Duration,
    pub http: HttpConfig,
    pub polling: PollingConfig,
    pub metrics: MetricsConfig,
    pub detector: DetectorConfig,
    /// How long `shutdown` waits for workers before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            webhook_secret: SigningSecret::new(Vec::new()),
            dispatch: DispatchConfig::default(),
            dispatch_tick: Duration::from_secs(1),
            http: HttpConfig::default(),
            polling: PollingConfig::default(),
            metrics: MetricsConfig::default(),
            detector: DetectorConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Defaults with the given secret.
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            webhook_secret: SigningSecret::new(secret),
            ..Self::default()
        }
    }

    /// Load from a TOML file, then apply the environment override.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML. Missing fields keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let parsed: RawEngineConfig = toml::from_str(raw)?;
        parsed.into_config()
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(SECRET_ENV).filter(|s| !s.trim().is_empty()) {
            self.webhook_secret = SigningSecret::new(secret.into_bytes());
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook_secret.as_bytes().is_empty() {
            return Err(invalid(format!(
                "webhook secret is empty; set `webhook_secret` or {SECRET_ENV}"
            )));
        }
        if self.dispatch.max_in_flight == 0 {
            return Err(invalid("dispatch.max_in_flight must be at least 1"));
        }
        if self.dispatch.batch_size == 0 {
            return Err(invalid("dispatch.batch_size must be at least 1"));
        }
        if self.dispatch.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries must be at least 1"));
        }
        if self.dispatch.retry.base_delays.is_empty() {
            return Err(invalid("retry.base_delays_secs must not be empty"));
        }
        if self
            .dispatch
            .retry
            .base_delays
            .windows(2)
            .any(|pair| pair[0] > pair[1])
        {
            return Err(invalid("retry.base_delays_secs must be non-decreasing"));
        }
        if self.polling.policy.interval.is_zero() {
            return Err(invalid("polling.interval_secs must be positive"));
        }
        if self.polling.policy.max_failures == 0 {
            return Err(invalid("polling.max_failures must be at least 1"));
        }
        if self.polling.policy.lease.is_zero() {
            return Err(invalid("polling.lease_secs must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

fn secs(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    webhook_secret: Option<String>,
    shutdown_timeout_secs: Option<u64>,
    dispatch: Option<RawDispatch>,
    retry: Option<RawRetry>,
    http: Option<RawHttp>,
    polling: Option<RawPolling>,
    metrics: Option<RawMetrics>,
    detector: Option<RawDetector>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDispatch {
    max_in_flight: Option<usize>,
    batch_size: Option<usize>,
    claim_timeout_secs: Option<u64>,
    tick_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetry {
    max_retries: Option<u32>,
    base_delays_secs: Option<Vec<u64>>,
    connect_retries: Option<u32>,
    connect_retry_base_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHttp {
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolling {
    interval_secs: Option<u64>,
    max_backoff_secs: Option<u64>,
    max_failures: Option<u32>,
    lease_secs: Option<u64>,
    tick_secs: Option<u64>,
    max_concurrent_sweeps: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMetrics {
    interval_secs: Option<u64>,
    /// `0` disables pruning.
    retention_days: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDetector {
    snapshot_ttl_secs: Option<u64>,
    snapshot_capacity: Option<usize>,
    wake_capacity: Option<usize>,
}

impl RawEngineConfig {
    fn into_config(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();

        let dispatch = self.dispatch.unwrap_or_default();
        let retry = self.retry.unwrap_or_default();
        let default_retry = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(default_retry.max_retries),
            base_delays: retry
                .base_delays_secs
                .map(|delays| delays.into_iter().map(Duration::from_secs).collect())
                .unwrap_or(default_retry.base_delays),
            connect_retries: retry.connect_retries.unwrap_or(default_retry.connect_retries),
            connect_retry_base: retry
                .connect_retry_base_ms
                .map(Duration::from_millis)
                .unwrap_or(default_retry.connect_retry_base),
        };
        let dispatch_config = DispatchConfig {
            max_in_flight: dispatch
                .max_in_flight
                .unwrap_or(defaults.dispatch.max_in_flight),
            batch_size: dispatch.batch_size.unwrap_or(defaults.dispatch.batch_size),
            claim_timeout: secs(dispatch.claim_timeout_secs, defaults.dispatch.claim_timeout),
            retry,
        };

        let http = self.http.unwrap_or_default();
        let http = HttpConfig {
            connect_timeout: secs(http.connect_timeout_secs, defaults.http.connect_timeout),
            request_timeout: secs(http.request_timeout_secs, defaults.http.request_timeout),
        };

        let polling = self.polling.unwrap_or_default();
        let default_policy = PollingPolicy::default();
        let polling_config = PollingConfig {
            policy: PollingPolicy {
                interval: secs(polling.interval_secs, default_policy.interval),
                max_backoff: secs(polling.max_backoff_secs, default_policy.max_backoff),
                max_failures: polling.max_failures.unwrap_or(default_policy.max_failures),
                lease: secs(polling.lease_secs, default_policy.lease),
            },
            tick: secs(polling.tick_secs, defaults.polling.tick),
            max_concurrent_sweeps: polling
                .max_concurrent_sweeps
                .unwrap_or(defaults.polling.max_concurrent_sweeps),
        };

        let metrics = self.metrics.unwrap_or_default();
        let metrics_config = MetricsConfig {
            interval: secs(metrics.interval_secs, defaults.metrics.interval),
            retention: match metrics.retention_days {
                Some(0) => None,
                Some(days) => Some(Duration::from_secs(days * 24 * 60 * 60)),
                None => defaults.metrics.retention,
            },
        };

        let detector = self.detector.unwrap_or_default();
        let detector_config = DetectorConfig {
            snapshot_ttl: secs(detector.snapshot_ttl_secs, defaults.detector.snapshot_ttl),
            snapshot_capacity: detector
                .snapshot_capacity
                .unwrap_or(defaults.detector.snapshot_capacity),
            wake_capacity: detector
                .wake_capacity
                .unwrap_or(defaults.detector.wake_capacity),
        };

        let webhook_secret = match self.webhook_secret {
            Some(secret) if secret.trim().is_empty() => {
                return Err(invalid("webhook_secret must not be blank"))
            }
            Some(secret) => SigningSecret::new(secret.into_bytes()),
            None => defaults.webhook_secret,
        };

        Ok(EngineConfig {
            webhook_secret,
            dispatch: dispatch_config,
            dispatch_tick: secs(dispatch.tick_secs, defaults.dispatch_tick),
            http,
            polling: polling_config,
            metrics: metrics_config,
            detector: detector_config,
            shutdown_timeout: secs(self.shutdown_timeout_secs, defaults.shutdown_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.dispatch.max_in_flight, 10);
        assert_eq!(config.dispatch.retry, RetryPolicy::default());
        assert_eq!(config.polling.policy.interval, Duration::from_secs(60));
        assert_eq!(config.http.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.http.request_timeout, Duration::from_secs(5));
        assert!(config.webhook_secret.as_bytes().is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sections_override_defaults() {
        let raw = r#"
            webhook_secret = "s3cret"

            [dispatch]
            max_in_flight = 4
            tick_secs = 2

            [retry]
            max_retries = 3
            base_delays_secs = [1, 5]

            [polling]
            interval_secs = 30
            max_failures = 2

            [metrics]
            retention_days = 0
        "#;
        let config = EngineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.webhook_secret.as_bytes(), b"s3cret");
        assert_eq!(config.dispatch.max_in_flight, 4);
        assert_eq!(config.dispatch_tick, Duration::from_secs(2));
        assert_eq!(config.dispatch.retry.max_retries, 3);
        assert_eq!(
            config.dispatch.retry.base_delays,
            vec![Duration::from_secs(1), Duration::from_secs(5)]
        );
        assert_eq!(config.polling.policy.interval, Duration::from_secs(30));
        assert_eq!(config.polling.policy.max_failures, 2);
        assert_eq!(config.metrics.retention, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml_str("[dispatch]\nmax_inflight = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides_secret() {
        let mut config = EngineConfig::from_toml_str("webhook_secret = \"file\"").unwrap();
        config.apply_env_with(|key| (key == SECRET_ENV).then(|| "env".to_string()));
        assert_eq!(config.webhook_secret.as_bytes(), b"env");

        config.apply_env_with(|_| Some("   ".to_string()));
        assert_eq!(config.webhook_secret.as_bytes(), b"env");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::with_secret("k");
        config.validate().unwrap();

        config.dispatch.retry.base_delays = vec![Duration::from_secs(4), Duration::from_secs(2)];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::with_secret("k");
        config.dispatch.max_in_flight = 0;
        assert!(config.validate().is_err());

        assert!(EngineConfig::from_toml_str("webhook_secret = \" \"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "webhook_secret = \"from-file\"\n[polling]\ntick_secs = 9").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.polling.tick, Duration::from_secs(9));

        let missing = EngineConfig::load(Path::new("/nonexistent/sitesync.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
