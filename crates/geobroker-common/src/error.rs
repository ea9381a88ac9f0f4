//! Error types for geobroker.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`BrokerError`]: Errors observed by callers of the request broker
//! - [`GeometryError`]: Errors raised while evaluating a geometry operation

use thiserror::Error;

/// Errors returned through the broker's asynchronous surface.
///
/// Every failure of an invocation is reported as one of these variants.
/// Only [`BrokerError::ContextFailure`] has effects beyond the request that
/// observed it: it is broadcast to every in-flight request and switches the
/// broker to degraded mode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No response arrived within the allotted window.
    #[error("Operation {operation} timed out after {duration_ms}ms")]
    Timeout {
        /// Tag of the operation that timed out.
        operation: String,
        /// The timeout window in milliseconds.
        duration_ms: u64,
    },

    /// The execution context errored, exited, or could not be started.
    #[error("Execution context failure: {reason}")]
    ContextFailure {
        /// Description of the context-level failure.
        reason: String,
    },

    /// The request was well formed but the geometry computation failed.
    #[error("Operation failed: {message}")]
    OperationError {
        /// Message carried back from the computation.
        message: String,
    },

    /// The operation tag is not one the execution context understands.
    #[error("Unknown operation: {operation}")]
    UnknownOperation {
        /// The unrecognised tag.
        operation: String,
    },

    /// The broker was shut down while the request was in flight.
    #[error("Request cancelled: broker shut down")]
    Cancelled,
}

/// Errors from geometry evaluation.
///
/// These are always local to one request and surface to the caller as
/// [`BrokerError::OperationError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    /// Coordinates are non-finite, out of range, or structurally invalid.
    #[error("Invalid coordinates: {reason}")]
    InvalidCoordinates {
        /// Description of what was wrong.
        reason: String,
    },

    /// The geometry type is not supported by the requested operation.
    #[error("Unsupported geometry type: {kind}")]
    UnsupportedGeometry {
        /// The offending geometry type.
        kind: String,
    },

    /// The geometry has no positions to operate on.
    #[error("Geometry is empty")]
    EmptyGeometry,

    /// The payload did not match the shape expected by the operation.
    #[error("Invalid payload: {reason}")]
    InvalidPayload {
        /// Decoder message.
        reason: String,
    },

    /// An identify request referenced a region index that was never loaded.
    #[error("Region index '{name}' is not loaded")]
    RegionIndexNotLoaded {
        /// Name of the missing index.
        name: String,
    },
}

impl BrokerError {
    /// Create a new `Timeout` error.
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create a new `ContextFailure` error.
    pub fn context_failure(reason: impl Into<String>) -> Self {
        Self::ContextFailure {
            reason: reason.into(),
        }
    }

    /// Create a new `OperationError` error.
    pub fn operation(message: impl Into<String>) -> Self {
        Self::OperationError {
            message: message.into(),
        }
    }

    /// Create a new `UnknownOperation` error.
    pub fn unknown_operation(operation: impl Into<String>) -> Self {
        Self::UnknownOperation {
            operation: operation.into(),
        }
    }

    /// Returns `true` if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this error reports a context-level failure.
    pub fn is_context_failure(&self) -> bool {
        matches!(self, Self::ContextFailure { .. })
    }

    /// Returns `true` if this error is a shutdown cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the error concerns only the request that observed it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OperationError { .. } | Self::UnknownOperation { .. } | Self::Timeout { .. }
        )
    }
}

impl From<GeometryError> for BrokerError {
    fn from(err: GeometryError) -> Self {
        Self::operation(err.to_string())
    }
}

impl GeometryError {
    /// Create a new `InvalidCoordinates` error.
    pub fn invalid_coordinates(reason: impl Into<String>) -> Self {
        Self::InvalidCoordinates {
            reason: reason.into(),
        }
    }

    /// Create a new `UnsupportedGeometry` error.
    pub fn unsupported(kind: impl Into<String>) -> Self {
        Self::UnsupportedGeometry { kind: kind.into() }
    }

    /// Create a new `InvalidPayload` error.
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for GeometryError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_payload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::timeout("IdentifyRegion", 10_000);
        assert_eq!(
            err.to_string(),
            "Operation IdentifyRegion timed out after 10000ms"
        );

        let err = BrokerError::Cancelled;
        assert_eq!(err.to_string(), "Request cancelled: broker shut down");
    }

    #[test]
    fn test_error_from_geometry() {
        let geo_err = GeometryError::EmptyGeometry;
        let broker_err: BrokerError = geo_err.into();

        assert_eq!(broker_err, BrokerError::operation("Geometry is empty"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(BrokerError::operation("bad ring").is_recoverable());
        assert!(BrokerError::unknown_operation("Buffer").is_recoverable());
        assert!(BrokerError::timeout("Distance", 5000).is_recoverable());
        assert!(!BrokerError::context_failure("worker exited").is_recoverable());
        assert!(!BrokerError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_classification() {
        assert!(BrokerError::timeout("Centroid", 1).is_timeout());
        assert!(BrokerError::context_failure("gone").is_context_failure());
        assert!(BrokerError::Cancelled.is_cancelled());
        assert!(!BrokerError::Cancelled.is_timeout());
    }

    #[test]
    fn test_payload_error_from_serde() {
        let err = serde_json::from_str::<Vec<f64>>("{").unwrap_err();
        let geo_err: GeometryError = err.into();
        assert!(matches!(geo_err, GeometryError::InvalidPayload { .. }));
    }
}
