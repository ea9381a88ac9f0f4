//! Common types, errors, and configuration for geobroker.
//!
//! This crate provides shared functionality used across the geobroker workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for the broker and its execution context
//! - The TOML configuration file format

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{BrokerConfig, ContextConfig, TimeoutConfig};
pub use config_file::{ConfigFile, ConfigFileError, DatasetEntry, LogFormat, LoggingConfig};
pub use error::{BrokerError, GeometryError};
