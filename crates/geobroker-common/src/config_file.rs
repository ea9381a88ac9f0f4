//! Configuration file structures for geobroker.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`LoggingConfig`]: Log output settings
//! - [`DatasetEntry`]: Boundary dataset to preload into the region index

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BrokerConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [broker.context]
/// enabled = true
/// thread_name = "geobroker-context"
///
/// [broker.timeouts]
/// point_ms = 5000
/// scan_ms = 10000
///
/// [logging]
/// format = "json"
///
/// [[datasets]]
/// name = "countries"
/// path = "./data/countries.geojson"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Broker configuration (context + timeouts).
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Log output configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Datasets to load into the region index at startup.
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading config file");

        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Look up a dataset entry by name.
    pub fn dataset(&self, name: &str) -> Option<&DatasetEntry> {
        self.datasets.iter().find(|d| d.name == name)
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// A boundary dataset to load at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetEntry {
    /// Region index name (e.g. `countries`).
    ///
    /// Identify requests reference the dataset by this name.
    pub name: String,

    /// Path to a GeoJSON `FeatureCollection` file.
    pub path: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}
