//! GeoJSON-shaped data model.
//!
//! This module provides the types exchanged with callers and the execution
//! context:
//! - [`LatLng`]: A query point
//! - [`Position`], [`Ring`], [`PolygonCoords`], [`MultiPolygonCoords`]: Raw coordinates
//! - [`Geometry`]: Tagged geometry (`Point`, `Polygon`, `MultiPolygon`)
//! - [`Feature`] and [`FeatureCollection`]: Boundary data with properties
//!
//! Coordinates follow GeoJSON order: `x` is longitude, `y` is latitude.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use geobroker_common::GeometryError;

/// A closed linear ring.
pub type Ring = Vec<Position>;

/// Polygon coordinates: exterior ring first, then holes.
pub type PolygonCoords = Vec<Ring>;

/// MultiPolygon coordinates: a list of polygons.
pub type MultiPolygonCoords = Vec<PolygonCoords>;

/// Minimum number of positions in a closed linear ring.
const MIN_RING_POSITIONS: usize = 4;

/// A geographic query point.
///
/// Deserializes from either a GeoJSON position `[lng, lat]` or an object
/// `{ "lat": .., "lng": .. }`. Always serializes as the object form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPoint")]
pub struct LatLng {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPoint {
    Position(Vec<f64>),
    Object {
        lat: f64,
        #[serde(alias = "lon")]
        lng: f64,
    },
}

impl TryFrom<RawPoint> for LatLng {
    type Error = GeometryError;

    fn try_from(raw: RawPoint) -> Result<Self, Self::Error> {
        match raw {
            RawPoint::Position(values) => {
                let position = Position::try_from(values)?;
                Ok(Self::new(position.y, position.x))
            }
            RawPoint::Object { lat, lng } => Ok(Self::new(lat, lng)),
        }
    }
}

impl LatLng {
    /// Create a point from latitude and longitude.
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check that the point is finite and within geographic range.
    pub fn validate(&self) -> Result<(), GeometryError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(GeometryError::invalid_coordinates(
                "point has non-finite coordinates",
            ));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(GeometryError::invalid_coordinates(format!(
                "latitude {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(GeometryError::invalid_coordinates(format!(
                "longitude {} out of range [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }

    /// Convert to a `geo` point (`x` = longitude).
    pub fn to_point(self) -> geo::Point<f64> {
        geo::Point::new(self.lng, self.lat)
    }
}

impl From<geo::Point<f64>> for LatLng {
    fn from(point: geo::Point<f64>) -> Self {
        Self::new(point.y(), point.x())
    }
}

/// A single GeoJSON position.
///
/// Accepts `[x, y]` or `[x, y, z]`; altitude is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct Position {
    /// Longitude.
    pub x: f64,
    /// Latitude.
    pub y: f64,
}

impl Position {
    /// Create a position from longitude and latitude.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn to_coord(self) -> Result<geo::Coord<f64>, GeometryError> {
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(GeometryError::invalid_coordinates(
                "position has non-finite coordinates",
            ));
        }
        Ok(geo::coord! { x: self.x, y: self.y })
    }
}

impl TryFrom<Vec<f64>> for Position {
    type Error = GeometryError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        match values.as_slice() {
            [x, y] | [x, y, _] => Ok(Self::new(*x, *y)),
            other => Err(GeometryError::invalid_coordinates(format!(
                "position must have 2 or 3 elements, got {}",
                other.len()
            ))),
        }
    }
}

impl From<Position> for [f64; 2] {
    fn from(position: Position) -> Self {
        [position.x, position.y]
    }
}

impl From<[f64; 2]> for Position {
    fn from([x, y]: [f64; 2]) -> Self {
        Self::new(x, y)
    }
}

/// A GeoJSON geometry supported by the geometry adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGeometry", into = "RawGeometry")]
pub enum Geometry {
    /// A single position.
    Point(Position),
    /// A polygon with optional holes.
    Polygon(PolygonCoords),
    /// A collection of polygons.
    MultiPolygon(MultiPolygonCoords),
}

#[derive(Serialize, Deserialize)]
struct RawGeometry {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Value,
}

impl TryFrom<RawGeometry> for Geometry {
    type Error = GeometryError;

    fn try_from(raw: RawGeometry) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "Point" => Ok(Self::Point(serde_json::from_value(raw.coordinates)?)),
            "Polygon" => Ok(Self::Polygon(serde_json::from_value(raw.coordinates)?)),
            "MultiPolygon" => Ok(Self::MultiPolygon(serde_json::from_value(raw.coordinates)?)),
            other => Err(GeometryError::unsupported(other)),
        }
    }
}

impl From<Geometry> for RawGeometry {
    fn from(geometry: Geometry) -> Self {
        let kind = geometry.kind().to_string();
        let coordinates = match geometry {
            Geometry::Point(p) => serde_json::json!([p.x, p.y]),
            Geometry::Polygon(rings) => positions_to_value(&[rings]).remove(0),
            Geometry::MultiPolygon(polygons) => Value::Array(positions_to_value(&polygons)),
        };
        Self { kind, coordinates }
    }
}

fn positions_to_value(polygons: &[PolygonCoords]) -> Vec<Value> {
    polygons
        .iter()
        .map(|rings| {
            Value::Array(
                rings
                    .iter()
                    .map(|ring| {
                        Value::Array(ring.iter().map(|p| serde_json::json!([p.x, p.y])).collect())
                    })
                    .collect(),
            )
        })
        .collect()
}

impl Geometry {
    /// GeoJSON type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Point(_) => "Point",
            Self::Polygon(_) => "Polygon",
            Self::MultiPolygon(_) => "MultiPolygon",
        }
    }

    /// Convert to a validated `geo` geometry.
    pub fn to_geo(&self) -> Result<geo::Geometry<f64>, GeometryError> {
        match self {
            Self::Point(p) => Ok(geo::Geometry::Point(geo::Point::from(p.to_coord()?))),
            Self::Polygon(rings) => Ok(geo::Geometry::Polygon(polygon_to_geo(rings)?)),
            Self::MultiPolygon(polygons) => {
                Ok(geo::Geometry::MultiPolygon(multi_polygon_to_geo(polygons)?))
            }
        }
    }
}

fn ring_to_line_string(ring: &[Position]) -> Result<geo::LineString<f64>, GeometryError> {
    if ring.len() < MIN_RING_POSITIONS {
        return Err(GeometryError::invalid_coordinates(format!(
            "linear ring must have at least {MIN_RING_POSITIONS} positions, got {}",
            ring.len()
        )));
    }
    let coords = ring
        .iter()
        .map(|p| p.to_coord())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(geo::LineString::new(coords))
}

/// Build a `geo` polygon from GeoJSON rings.
pub fn polygon_to_geo(rings: &[Ring]) -> Result<geo::Polygon<f64>, GeometryError> {
    let (exterior, holes) = rings.split_first().ok_or(GeometryError::EmptyGeometry)?;
    let exterior = ring_to_line_string(exterior)?;
    let interiors = holes
        .iter()
        .map(|ring| ring_to_line_string(ring))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(geo::Polygon::new(exterior, interiors))
}

/// Build a `geo` multipolygon from GeoJSON polygon coordinates.
pub fn multi_polygon_to_geo(
    polygons: &[PolygonCoords],
) -> Result<geo::MultiPolygon<f64>, GeometryError> {
    if polygons.is_empty() {
        return Err(GeometryError::EmptyGeometry);
    }
    let polygons = polygons
        .iter()
        .map(|rings| polygon_to_geo(rings))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(geo::MultiPolygon::new(polygons))
}

/// A boundary feature: geometry plus a property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Optional GeoJSON feature identifier (string or number).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// The boundary geometry.
    pub geometry: Geometry,

    /// Free-form properties (ISO codes, display names).
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    /// Create a feature without an identifier.
    pub fn new(geometry: Geometry, properties: Map<String, Value>) -> Self {
        Self {
            id: None,
            geometry,
            properties: Some(properties),
        }
    }

    /// Look up a non-empty string property.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties
            .as_ref()?
            .get(key)?
            .as_str()
            .filter(|s| !s.is_empty())
    }
}

/// A GeoJSON feature collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    /// Features in file order.
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    /// Parse a collection from GeoJSON text.
    pub fn from_json(content: &str) -> Result<Self, GeometryError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read a collection from a GeoJSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GeometryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GeometryError::invalid_payload(format!("failed to read {}: {e}", path.display()))
        })?;
        let collection = Self::from_json(&content)?;
        debug!(path = %path.display(), features = collection.len(), "Loaded feature collection");
        Ok(collection)
    }

    /// Number of features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Returns `true` if the collection has no features.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
