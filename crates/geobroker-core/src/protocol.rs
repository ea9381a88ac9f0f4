//! Wire protocol between the broker and the execution context.
//!
//! Messages cross the context boundary as serialized JSON text:
//!
//! ```text
//! caller -> context  { "correlationId": 7, "operation": "IdentifyRegion", "payload": {..} }
//! context -> caller  { "correlationId": 7, "success": true, "result": {..} }
//!                    { "correlationId": 7, "success": false, "error": "..", "kind": "operation" }
//! ```
//!
//! The inbound `operation` is kept as a string so an unrecognised tag still
//! decodes and can be answered with a failure for that correlation id.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use geobroker_common::BrokerError;

use crate::adapter::DistanceUnit;
use crate::geometry::{Feature, Geometry, LatLng, MultiPolygonCoords, PolygonCoords};

/// Correlation identifier linking a request to its response.
pub type CorrelationId = u64;

/// Prefix of the failure message for unrecognised operation tags.
pub const UNKNOWN_OPERATION_PREFIX: &str = "unknown operation: ";

/// Operations understood by the execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Point inside a single polygon.
    PointInPolygon,
    /// Point inside any polygon of a multipolygon.
    PointInMultiPolygon,
    /// First feature containing a point.
    IdentifyRegion,
    /// Great-circle distance between two points.
    Distance,
    /// Bounding box of a geometry.
    BoundingBox,
    /// Centroid of a geometry.
    Centroid,
    /// Store a feature collection under a name inside the context.
    LoadRegionIndex,
    /// Drop one or all stored feature collections.
    ClearRegionIndex,
}

impl Operation {
    /// All operations.
    pub const ALL: [Operation; 8] = [
        Operation::PointInPolygon,
        Operation::PointInMultiPolygon,
        Operation::IdentifyRegion,
        Operation::Distance,
        Operation::BoundingBox,
        Operation::Centroid,
        Operation::LoadRegionIndex,
        Operation::ClearRegionIndex,
    ];

    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PointInPolygon => "PointInPolygon",
            Self::PointInMultiPolygon => "PointInMultiPolygon",
            Self::IdentifyRegion => "IdentifyRegion",
            Self::Distance => "Distance",
            Self::BoundingBox => "BoundingBox",
            Self::Centroid => "Centroid",
            Self::LoadRegionIndex => "LoadRegionIndex",
            Self::ClearRegionIndex => "ClearRegionIndex",
        }
    }

    /// Whether the operation walks a whole feature collection.
    ///
    /// Scans get the longer response window.
    pub fn is_collection_scan(&self) -> bool {
        matches!(self, Self::IdentifyRegion | Self::LoadRegionIndex)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| BrokerError::unknown_operation(s))
    }
}

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    /// Correlation identifier assigned by the broker.
    pub correlation_id: CorrelationId,
    /// Operation tag.
    pub operation: String,
    /// Operation-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl RequestMessage {
    /// Create a request for a known operation.
    pub fn new(correlation_id: CorrelationId, operation: Operation, payload: Value) -> Self {
        Self {
            correlation_id,
            operation: operation.as_str().to_string(),
            payload,
        }
    }
}

/// Classification of a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The computation itself failed.
    Operation,
    /// The operation tag was not recognised.
    UnknownOperation,
}

/// A response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    /// Correlation identifier copied from the request.
    pub correlation_id: CorrelationId,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl ResponseMessage {
    /// Create a successful response.
    pub fn success(correlation_id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            result: Some(result),
            error: None,
            kind: None,
        }
    }

    /// Create a failed response.
    pub fn failure(
        correlation_id: CorrelationId,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            success: false,
            result: None,
            error: Some(error.into()),
            kind: Some(kind),
        }
    }

    /// Convert into the caller-facing outcome.
    pub fn into_outcome(self) -> Result<Value, BrokerError> {
        if self.success {
            return Ok(self.result.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or_default();
        match self.kind {
            Some(FailureKind::UnknownOperation) => {
                let tag = error.strip_prefix(UNKNOWN_OPERATION_PREFIX).unwrap_or(&error);
                Err(BrokerError::unknown_operation(tag))
            }
            Some(FailureKind::Operation) | None => Err(BrokerError::operation(error)),
        }
    }
}

/// Payload of [`Operation::PointInPolygon`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointInPolygonPayload {
    pub point: LatLng,
    pub polygon: PolygonCoords,
}

/// Payload of [`Operation::PointInMultiPolygon`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointInMultiPolygonPayload {
    pub point: LatLng,
    pub multi_polygon: MultiPolygonCoords,
}

/// Payload of [`Operation::IdentifyRegion`].
///
/// Either `features` is embedded, or `index` names a collection previously
/// stored with [`Operation::LoadRegionIndex`]. Embedded features win when
/// both are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyRegionPayload {
    pub point: LatLng,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<Feature>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
}

/// Payload of [`Operation::Distance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistancePayload {
    pub from: LatLng,
    pub to: LatLng,
    #[serde(default)]
    pub unit: DistanceUnit,
}

/// Payload of [`Operation::BoundingBox`] and [`Operation::Centroid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryPayload {
    pub geometry: Geometry,
}

/// Payload of [`Operation::LoadRegionIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRegionIndexPayload {
    pub name: String,
    pub features: Vec<Feature>,
}

/// Payload of [`Operation::ClearRegionIndex`]. No name clears everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearRegionIndexPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Result of [`Operation::LoadRegionIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedIndex {
    pub name: String,
    pub count: usize,
}
