// Copyright 2025-Present Tracebeam authors
// SPDX-License-Identifier: Apache-2.0

use std::env;

use tracebeam_collect::gauge::GaugeSourceConfig;

use crate::error::AgentError;

/// Configuration for the capture and collection core.
///
/// Gauge sources are registered programmatically by the host; everything else
/// can be overridden through `TRACEBEAM_*` environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Store a partial trace once a transaction has run this long (ms)
    pub store_threshold_millis: u64,
    /// Cap on trace entries captured per transaction
    pub max_entries_per_transaction: usize,
    /// Stack sampling period for explicit profiling (ms)
    pub profiling_interval_millis: u64,
    /// Latency after which outlier stack sampling starts (ms)
    pub outlier_threshold_millis: u64,
    /// Stack sampling period for outlier profiling (ms)
    pub outlier_interval_millis: u64,
    /// Width of one aggregate bucket (ms)
    pub aggregate_interval_millis: u64,
    /// Gauge poll period (ms)
    pub gauge_poll_interval_millis: u64,
    /// Suppress "source not found" warnings this long after startup (s)
    pub gauge_grace_window_secs: u64,
    pub gauge_sources: Vec<GaugeSourceConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            store_threshold_millis: 2_000,
            max_entries_per_transaction: 2_000,
            profiling_interval_millis: 1_000,
            outlier_threshold_millis: 30_000,
            outlier_interval_millis: 1_000,
            aggregate_interval_millis: 60_000,
            gauge_poll_interval_millis: 5_000,
            gauge_grace_window_secs: 60,
            gauge_sources: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, AgentError> {
        let defaults = AgentConfig::default();
        let config = Self {
            store_threshold_millis: env_u64(
                "TRACEBEAM_STORE_THRESHOLD_MS",
                defaults.store_threshold_millis,
            ),
            max_entries_per_transaction: env_u64(
                "TRACEBEAM_MAX_ENTRIES",
                defaults.max_entries_per_transaction as u64,
            ) as usize,
            profiling_interval_millis: env_u64(
                "TRACEBEAM_PROFILING_INTERVAL_MS",
                defaults.profiling_interval_millis,
            ),
            outlier_threshold_millis: env_u64(
                "TRACEBEAM_OUTLIER_THRESHOLD_MS",
                defaults.outlier_threshold_millis,
            ),
            outlier_interval_millis: env_u64(
                "TRACEBEAM_OUTLIER_INTERVAL_MS",
                defaults.outlier_interval_millis,
            ),
            aggregate_interval_millis: env_u64(
                "TRACEBEAM_AGGREGATE_INTERVAL_MS",
                defaults.aggregate_interval_millis,
            ),
            gauge_poll_interval_millis: env_u64(
                "TRACEBEAM_GAUGE_POLL_INTERVAL_MS",
                defaults.gauge_poll_interval_millis,
            ),
            gauge_grace_window_secs: env_u64(
                "TRACEBEAM_GAUGE_GRACE_WINDOW_S",
                defaults.gauge_grace_window_secs,
            ),
            gauge_sources: Vec::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.aggregate_interval_millis == 0 {
            return Err(AgentError::InvalidConfig(
                "aggregate interval must be positive".to_string(),
            ));
        }
        if self.gauge_poll_interval_millis == 0 {
            return Err(AgentError::InvalidConfig(
                "gauge poll interval must be positive".to_string(),
            ));
        }
        if self.profiling_interval_millis == 0 || self.outlier_interval_millis == 0 {
            return Err(AgentError::InvalidConfig(
                "sampler intervals must be positive".to_string(),
            ));
        }
        if self.max_entries_per_transaction == 0 {
            return Err(AgentError::InvalidConfig(
                "max entries per transaction must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_aggregate_interval() {
        let config = AgentConfig {
            aggregate_interval_millis: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_gauge_poll_interval() {
        let config = AgentConfig {
            gauge_poll_interval_millis: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_max_entries() {
        let config = AgentConfig {
            max_entries_per_transaction: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
