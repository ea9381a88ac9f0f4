//! Execution context message handler.
//!
//! [`MessageHandler`] decodes a request, dispatches it to the geometry
//! adapter, and encodes a response. A failing request never takes the
//! handler down: decode errors, geometry errors, unknown operation tags and
//! panics inside the computation all become a failed response for that
//! correlation id.
//!
//! The same handler type runs inside the execution context thread and, in
//! degraded mode, inline on the caller's task. Both paths enter through
//! [`MessageHandler::handle_raw`], so they see identical bytes and produce
//! identical results.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use geobroker_common::GeometryError;

use crate::adapter::GeometryAdapter;
use crate::index::RegionIndex;
use crate::protocol::{
    ClearRegionIndexPayload, DistancePayload, FailureKind, GeometryPayload,
    IdentifyRegionPayload, LoadRegionIndexPayload, LoadedIndex, Operation,
    PointInMultiPolygonPayload, PointInPolygonPayload, RequestMessage, ResponseMessage,
    UNKNOWN_OPERATION_PREFIX,
};
use crate::region::identify_region;

/// Request handler owning a geometry adapter and a region index.
///
/// Not thread-safe by design of its callers: one handler processes one
/// message at a time, which serializes all mutation of the region index.
pub struct MessageHandler {
    adapter: Arc<dyn GeometryAdapter>,
    index: RegionIndex,
}

impl MessageHandler {
    /// Create a handler with an empty region index.
    pub fn new(adapter: Arc<dyn GeometryAdapter>) -> Self {
        Self {
            adapter,
            index: RegionIndex::new(),
        }
    }

    /// The region index held by this handler.
    pub fn index(&self) -> &RegionIndex {
        &self.index
    }

    /// Mutable access to the region index, bypassing the wire protocol.
    pub fn index_mut(&mut self) -> &mut RegionIndex {
        &mut self.index
    }

    /// Handle a serialized request and return the serialized response.
    ///
    /// # Errors
    ///
    /// Fails only when `raw` is not a request envelope at all, in which
    /// case there is no correlation id to answer.
    pub fn handle_raw(&mut self, raw: &str) -> Result<String, serde_json::Error> {
        let request: RequestMessage = serde_json::from_str(raw)?;
        let response = self.handle(request);
        serde_json::to_string(&response)
    }

    /// Handle a decoded request.
    pub fn handle(&mut self, request: RequestMessage) -> ResponseMessage {
        let correlation_id = request.correlation_id;

        let Ok(operation) = request.operation.parse::<Operation>() else {
            warn!(
                correlation_id,
                operation = %request.operation,
                "Rejecting unknown operation"
            );
            return ResponseMessage::failure(
                correlation_id,
                FailureKind::UnknownOperation,
                format!("{UNKNOWN_OPERATION_PREFIX}{}", request.operation),
            );
        };

        let payload = request.payload;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(operation, payload)));

        match outcome {
            Ok(Ok(result)) => {
                debug!(correlation_id, %operation, "Operation completed");
                ResponseMessage::success(correlation_id, result)
            }
            Ok(Err(err)) => {
                debug!(correlation_id, %operation, error = %err, "Operation failed");
                ResponseMessage::failure(correlation_id, FailureKind::Operation, err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(correlation_id, %operation, panic = %message, "Operation panicked");
                ResponseMessage::failure(
                    correlation_id,
                    FailureKind::Operation,
                    format!("geometry computation panicked: {message}"),
                )
            }
        }
    }

    /// Run one operation against its payload.
    pub fn execute(&mut self, operation: Operation, payload: Value) -> Result<Value, GeometryError> {
        match operation {
            Operation::PointInPolygon => {
                let p: PointInPolygonPayload = decode(payload)?;
                let inside = self.adapter.point_in_polygon(p.point, &p.polygon)?;
                Ok(Value::Bool(inside))
            }
            Operation::PointInMultiPolygon => {
                let p: PointInMultiPolygonPayload = decode(payload)?;
                let inside = self
                    .adapter
                    .point_in_multi_polygon(p.point, &p.multi_polygon)?;
                Ok(Value::Bool(inside))
            }
            Operation::IdentifyRegion => {
                let p: IdentifyRegionPayload = decode(payload)?;
                let matched = match (p.features, p.index) {
                    (Some(features), _) => {
                        identify_region(self.adapter.as_ref(), p.point, &features)?
                    }
                    (None, Some(name)) => {
                        let features = self
                            .index
                            .get(&name)
                            .ok_or(GeometryError::RegionIndexNotLoaded { name })?;
                        identify_region(self.adapter.as_ref(), p.point, &features)?
                    }
                    (None, None) => {
                        return Err(GeometryError::invalid_payload(
                            "identify request needs `features` or `index`",
                        ));
                    }
                };
                Ok(serde_json::to_value(matched)?)
            }
            Operation::Distance => {
                let p: DistancePayload = decode(payload)?;
                let distance = self.adapter.distance(p.from, p.to, p.unit)?;
                Ok(serde_json::to_value(distance)?)
            }
            Operation::BoundingBox => {
                let p: GeometryPayload = decode(payload)?;
                Ok(serde_json::to_value(self.adapter.bbox(&p.geometry)?)?)
            }
            Operation::Centroid => {
                let p: GeometryPayload = decode(payload)?;
                Ok(serde_json::to_value(self.adapter.centroid(&p.geometry)?)?)
            }
            Operation::LoadRegionIndex => {
                let p: LoadRegionIndexPayload = decode(payload)?;
                let count = self.index.load(p.name.clone(), p.features);
                Ok(serde_json::to_value(LoadedIndex {
                    name: p.name,
                    count,
                })?)
            }
            Operation::ClearRegionIndex => {
                let p: ClearRegionIndexPayload = decode(payload)?;
                let cleared = self.index.clear(p.name.as_deref());
                Ok(serde_json::json!({ "cleared": cleared }))
            }
        }
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("indexes", &self.index.names())
            .finish_non_exhaustive()
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, GeometryError> {
    Ok(serde_json::from_value(payload)?)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
