//! Configuration structures for geobroker.
//!
//! This module defines configuration options for the request broker:
//! - [`BrokerConfig`]: Top-level configuration containing all settings
//! - [`ContextConfig`]: Whether and how the execution context is started
//! - [`TimeoutConfig`]: Per-request response windows

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level broker configuration.
///
/// This structure contains all configuration options for a request broker.
/// It can be loaded from files (TOML, JSON) or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Execution context settings.
    #[serde(default)]
    pub context: ContextConfig,

    /// Response windows.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Execution context configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Start an execution context at all.
    ///
    /// When disabled the broker runs every operation in degraded mode,
    /// synchronously on the caller's task.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Name given to the execution context's OS thread.
    #[serde(default = "defaults::thread_name")]
    pub thread_name: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            thread_name: defaults::thread_name(),
        }
    }
}

/// Response windows for delegated requests.
///
/// Single-geometry operations and whole-collection scans get separate
/// windows; scans over hundreds of boundaries legitimately take longer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Window for single-geometry operations, in milliseconds.
    #[serde(default = "defaults::point_ms")]
    pub point_ms: u64,

    /// Window for whole-collection scans, in milliseconds.
    #[serde(default = "defaults::scan_ms")]
    pub scan_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            point_ms: defaults::point_ms(),
            scan_ms: defaults::scan_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Window for single-geometry operations.
    pub fn point(&self) -> Duration {
        Duration::from_millis(self.point_ms)
    }

    /// Window for whole-collection scans.
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn thread_name() -> String {
        "geobroker-context".to_string()
    }

    pub const fn point_ms() -> u64 {
        5_000
    }

    pub const fn scan_ms() -> u64 {
        10_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();

        assert!(config.context.enabled);
        assert_eq!(config.context.thread_name, "geobroker-context");
        assert_eq!(config.timeouts.point_ms, 5_000);
        assert_eq!(config.timeouts.scan_ms, 10_000);
    }

    #[test]
    fn test_config_serialization() {
        let config = BrokerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: BrokerConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.timeouts.scan_ms, deserialized.timeouts.scan_ms);
        assert_eq!(config.context.thread_name, deserialized.context.thread_name);
    }

    #[test]
    fn test_timeout_durations() {
        let config = TimeoutConfig {
            point_ms: 250,
            scan_ms: 750,
        };

        assert_eq!(config.point(), Duration::from_millis(250));
        assert_eq!(config.scan(), Duration::from_millis(750));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"timeouts": {"scan_ms": 30000}}"#;
        let config: BrokerConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.timeouts.scan_ms, 30_000);
        // Default values for unspecified fields
        assert_eq!(config.timeouts.point_ms, 5_000);
        assert!(config.context.enabled);
    }
}
