//! Geometry and execution-context internals for geobroker.
//!
//! This crate provides everything that runs inside an execution context:
//! - [`GeometryAdapter`]: The seam to the geometry library, with [`GeoAdapter`] on `geo`
//! - [`Feature`], [`Geometry`], [`LatLng`]: GeoJSON-shaped data model
//! - [`identify_region`]: First-match region scan
//! - [`RequestMessage`] / [`ResponseMessage`]: Wire protocol
//! - [`MessageHandler`]: Decode, dispatch, encode
//! - [`RegionIndex`]: Named feature collections cached in the context
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    MessageHandler                       │
//! │  (One per execution context, one message at a time)     │
//! │  - Decodes RequestMessage, encodes ResponseMessage      │
//! │  - Contains panics and errors per request               │
//! └─────────────────────────────────────────────────────────┘
//!               │                            │
//!               ▼                            ▼
//! ┌───────────────────────────┐  ┌──────────────────────────┐
//! │     GeometryAdapter       │  │       RegionIndex        │
//! │  (Pure, stateless)        │  │  (name -> features)      │
//! │  - point in (multi)polygon│  │  - load / clear          │
//! │  - distance, bbox, centroid│ │                          │
//! └───────────────────────────┘  └──────────────────────────┘
//! ```

pub mod adapter;
pub mod geometry;
pub mod handler;
pub mod index;
pub mod protocol;
pub mod region;

pub use adapter::{BoundingBox, DistanceUnit, GeoAdapter, GeometryAdapter};
pub use geometry::{
    Feature, FeatureCollection, Geometry, LatLng, MultiPolygonCoords, PolygonCoords, Position,
    Ring,
};
pub use handler::MessageHandler;
pub use index::RegionIndex;
pub use protocol::{
    CorrelationId, FailureKind, LoadedIndex, Operation, RequestMessage, ResponseMessage,
};
pub use region::{RegionMatch, identify_region, region_id, region_name};
