// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use crate::latency_summary::{
    SummaryConfig, DEFAULT_MAX_BINS, DEFAULT_RELATIVE_ACCURACY, MIN_RELATIVE_ACCURACY,
};
use crate::writer::WellKnownTags;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BUCKET_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_KEYS: usize = 2048;
pub const DEFAULT_BUFFER_CAPACITY: usize = 512 * 1024;
const MIN_SUMMARY_BINS: usize = 16;

/// Configuration for the trace stats pipeline
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Hostname attached to every bucket
    pub hostname: String,
    /// Environment attached to every bucket (e.g., prod, staging)
    pub env: String,
    /// Application version attached to every bucket
    pub version: String,
    /// Length of one aggregation window
    pub bucket_duration: Duration,
    /// Distinct keys per window before new keys go to the overflow cell
    pub max_keys: usize,
    /// Relative accuracy of latency quantile estimates
    pub relative_accuracy: f64,
    /// Upper bound on bins held by one latency summary
    pub summary_max_bins: usize,
    /// Initial capacity of the encoder buffer in bytes
    pub buffer_capacity: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            env: String::new(),
            version: String::new(),
            bucket_duration: DEFAULT_BUCKET_DURATION,
            max_keys: DEFAULT_MAX_KEYS,
            relative_accuracy: DEFAULT_RELATIVE_ACCURACY,
            summary_max_bins: DEFAULT_MAX_BINS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            log_level: "info".to_string(),
        }
    }
}

impl StatsConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let hostname = env::var("DD_HOSTNAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_default();
        let env = env::var("DD_ENV").unwrap_or_default();
        let version = env::var("DD_VERSION").unwrap_or_default();
        let bucket_duration = parse_env::<u64>("DD_TRACE_STATS_BUCKET_DURATION_SECS")
            .map_or(DEFAULT_BUCKET_DURATION, Duration::from_secs);
        let max_keys =
            parse_env("DD_TRACE_TRACER_METRICS_MAX_AGGREGATES").unwrap_or(DEFAULT_MAX_KEYS);
        let relative_accuracy =
            parse_env("DD_TRACE_STATS_RELATIVE_ACCURACY").unwrap_or(DEFAULT_RELATIVE_ACCURACY);
        let summary_max_bins =
            parse_env("DD_TRACE_STATS_SUMMARY_MAX_BINS").unwrap_or(DEFAULT_MAX_BINS);
        let buffer_capacity =
            parse_env("DD_TRACE_STATS_BUFFER_CAPACITY").unwrap_or(DEFAULT_BUFFER_CAPACITY);
        let log_level = env::var("DD_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            hostname,
            env,
            version,
            bucket_duration,
            max_keys,
            relative_accuracy,
            summary_max_bins,
            buffer_capacity,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_duration.is_zero() {
            return Err(ConfigError::Invalid(
                "Bucket duration must be greater than 0".to_string(),
            ));
        }

        if self.max_keys == 0 {
            return Err(ConfigError::Invalid(
                "Maximum aggregate keys must be greater than 0".to_string(),
            ));
        }

        if !(self.relative_accuracy >= MIN_RELATIVE_ACCURACY && self.relative_accuracy < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "Relative accuracy must be at least {MIN_RELATIVE_ACCURACY} and below 1, got {}",
                self.relative_accuracy
            )));
        }

        if self.summary_max_bins < MIN_SUMMARY_BINS {
            return Err(ConfigError::Invalid(format!(
                "Summary max bins must be at least {MIN_SUMMARY_BINS}, got {}",
                self.summary_max_bins
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn summary_config(&self) -> SummaryConfig {
        SummaryConfig::new(self.relative_accuracy, self.summary_max_bins)
    }

    #[must_use]
    pub fn well_known_tags(&self) -> WellKnownTags {
        WellKnownTags {
            hostname: self.hostname.clone(),
            env: self.env.clone(),
            version: self.version.clone(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 10] = [
        "DD_HOSTNAME",
        "HOSTNAME",
        "DD_ENV",
        "DD_VERSION",
        "DD_TRACE_STATS_BUCKET_DURATION_SECS",
        "DD_TRACE_TRACER_METRICS_MAX_AGGREGATES",
        "DD_TRACE_STATS_RELATIVE_ACCURACY",
        "DD_TRACE_STATS_SUMMARY_MAX_BINS",
        "DD_TRACE_STATS_BUFFER_CAPACITY",
        "DD_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = StatsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bucket_duration, Duration::from_secs(10));
        assert_eq!(config.max_keys, 2048);
    }

    #[test]
    fn test_validate_zero_bucket_duration() {
        let config = StatsConfig {
            bucket_duration: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_max_keys() {
        let config = StatsConfig {
            max_keys: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_relative_accuracy() {
        for relative_accuracy in [0.0, 1.0, -0.5, f64::NAN, 1e-6, 1e-300] {
            let config = StatsConfig {
                relative_accuracy,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{relative_accuracy}");
        }
        for relative_accuracy in [MIN_RELATIVE_ACCURACY, 0.05, 0.5] {
            let config = StatsConfig {
                relative_accuracy,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "{relative_accuracy}");
        }
    }

    #[test]
    fn test_validate_summary_max_bins() {
        let config = StatsConfig {
            summary_max_bins: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = StatsConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level 'verbose'"));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = StatsConfig::from_env().unwrap();
        assert_eq!(config.hostname, "");
        assert_eq!(config.bucket_duration, DEFAULT_BUCKET_DURATION);
        assert_eq!(config.max_keys, DEFAULT_MAX_KEYS);
        assert_eq!(config.summary_max_bins, DEFAULT_MAX_BINS);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("DD_HOSTNAME", "host-a");
        env::set_var("DD_ENV", "prod");
        env::set_var("DD_VERSION", "1.2.3");
        env::set_var("DD_TRACE_STATS_BUCKET_DURATION_SECS", "5");
        env::set_var("DD_TRACE_TRACER_METRICS_MAX_AGGREGATES", "100");
        env::set_var("DD_TRACE_STATS_SUMMARY_MAX_BINS", "512");
        env::set_var("DD_LOG_LEVEL", "DEBUG");

        let config = StatsConfig::from_env().unwrap();
        assert_eq!(config.hostname, "host-a");
        assert_eq!(config.env, "prod");
        assert_eq!(config.version, "1.2.3");
        assert_eq!(config.bucket_duration, Duration::from_secs(5));
        assert_eq!(config.max_keys, 100);
        assert_eq!(config.summary_max_bins, 512);
        assert_eq!(config.log_level, "debug");

        let tags = config.well_known_tags();
        assert_eq!(tags.hostname, "host-a");
        assert_eq!(tags.env, "prod");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_hostname_fallback() {
        clear_env();
        env::set_var("HOSTNAME", "container-1");
        let config = StatsConfig::from_env().unwrap();
        assert_eq!(config.hostname, "container-1");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_unparseable_values_use_defaults() {
        clear_env();
        env::set_var("DD_TRACE_TRACER_METRICS_MAX_AGGREGATES", "lots");
        env::set_var("DD_TRACE_STATS_BUCKET_DURATION_SECS", "-1");
        let config = StatsConfig::from_env().unwrap();
        assert_eq!(config.max_keys, DEFAULT_MAX_KEYS);
        assert_eq!(config.bucket_duration, DEFAULT_BUCKET_DURATION);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_out_of_range() {
        clear_env();
        env::set_var("DD_TRACE_STATS_BUCKET_DURATION_SECS", "0");
        assert!(StatsConfig::from_env().is_err());
        clear_env();
    }
}
