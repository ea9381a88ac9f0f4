//! Geometry adapter.
//!
//! The [`GeometryAdapter`] trait is the narrow seam between the broker and
//! the geometry library. [`GeoAdapter`] implements it on top of the `geo`
//! crate. Implementations are pure, synchronous, and stateless.

use geo::{BoundingRect, Centroid, HaversineDistance, Intersects};
use serde::{Deserialize, Serialize};

use geobroker_common::GeometryError;

use crate::geometry::{Geometry, LatLng, PolygonCoords, Ring, polygon_to_geo};

/// Unit for [`GeometryAdapter::distance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnit {
    /// Kilometers.
    #[default]
    Kilometers,
    /// Meters.
    Meters,
    /// Statute miles.
    Miles,
    /// Nautical miles.
    NauticalMiles,
}

impl DistanceUnit {
    /// Convert a distance in meters to this unit.
    pub fn from_meters(self, meters: f64) -> f64 {
        match self {
            Self::Kilometers => meters / 1_000.0,
            Self::Meters => meters,
            Self::Miles => meters / 1_609.344,
            Self::NauticalMiles => meters / 1_852.0,
        }
    }
}

/// Axis-aligned bounding box `[min_x, min_y, max_x, max_y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    /// Western-most longitude.
    pub fn min_x(&self) -> f64 {
        self.0[0]
    }

    /// Southern-most latitude.
    pub fn min_y(&self) -> f64 {
        self.0[1]
    }

    /// Eastern-most longitude.
    pub fn max_x(&self) -> f64 {
        self.0[2]
    }

    /// Northern-most latitude.
    pub fn max_y(&self) -> f64 {
        self.0[3]
    }
}

/// Geometry operations consumed by the execution context.
///
/// `point_in_multi_polygon` and `contains` are provided in terms of
/// `point_in_polygon`, so every implementation applies the same
/// multipolygon policy: a logical OR over the polygon list, in order,
/// stopping at the first hit.
pub trait GeometryAdapter: Send + Sync {
    /// Test whether `point` lies inside (or on the boundary of) a polygon.
    fn point_in_polygon(&self, point: LatLng, polygon: &[Ring]) -> Result<bool, GeometryError>;

    /// Great-circle distance between two points.
    fn distance(&self, from: LatLng, to: LatLng, unit: DistanceUnit)
    -> Result<f64, GeometryError>;

    /// Bounding box of a geometry.
    fn bbox(&self, geometry: &Geometry) -> Result<BoundingBox, GeometryError>;

    /// Centroid of a geometry.
    fn centroid(&self, geometry: &Geometry) -> Result<LatLng, GeometryError>;

    /// Test whether `point` lies inside any polygon of a multipolygon.
    fn point_in_multi_polygon(
        &self,
        point: LatLng,
        multi_polygon: &[PolygonCoords],
    ) -> Result<bool, GeometryError> {
        if multi_polygon.is_empty() {
            return Err(GeometryError::EmptyGeometry);
        }
        for polygon in multi_polygon {
            if self.point_in_polygon(point, polygon)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Containment against a tagged geometry. Points never contain anything.
    fn contains(&self, point: LatLng, geometry: &Geometry) -> Result<bool, GeometryError> {
        match geometry {
            Geometry::Polygon(rings) => self.point_in_polygon(point, rings),
            Geometry::MultiPolygon(polygons) => self.point_in_multi_polygon(point, polygons),
            Geometry::Point(_) => Ok(false),
        }
    }
}

/// [`GeometryAdapter`] backed by the `geo` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoAdapter;

impl GeoAdapter {
    /// Create a new adapter.
    pub const fn new() -> Self {
        Self
    }
}

impl GeometryAdapter for GeoAdapter {
    fn point_in_polygon(&self, point: LatLng, polygon: &[Ring]) -> Result<bool, GeometryError> {
        point.validate()?;
        let polygon = polygon_to_geo(polygon)?;
        Ok(point.to_point().intersects(&polygon))
    }

    fn distance(
        &self,
        from: LatLng,
        to: LatLng,
        unit: DistanceUnit,
    ) -> Result<f64, GeometryError> {
        from.validate()?;
        to.validate()?;
        let meters = from.to_point().haversine_distance(&to.to_point());
        Ok(unit.from_meters(meters))
    }

    fn bbox(&self, geometry: &Geometry) -> Result<BoundingBox, GeometryError> {
        let rect = geometry
            .to_geo()?
            .bounding_rect()
            .ok_or(GeometryError::EmptyGeometry)?;
        Ok(BoundingBox([
            rect.min().x,
            rect.min().y,
            rect.max().x,
            rect.max().y,
        ]))
    }

    fn centroid(&self, geometry: &Geometry) -> Result<LatLng, GeometryError> {
        geometry
            .to_geo()?
            .centroid()
            .map(LatLng::from)
            .ok_or(GeometryError::EmptyGeometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Position;

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> PolygonCoords {
        vec![vec![
            Position::new(min_x, min_y),
            Position::new(max_x, min_y),
            Position::new(max_x, max_y),
            Position::new(min_x, max_y),
            Position::new(min_x, min_y),
        ]]
    }

    #[test]
    fn test_point_in_polygon_interior() {
        let adapter = GeoAdapter::new();
        let inside = adapter
            .point_in_polygon(LatLng::new(5.0, 5.0), &rect(0.0, 0.0, 10.0, 10.0))
            .unwrap();
        assert!(inside);
    }

    #[test]
    fn test_point_in_polygon_far_outside() {
        let adapter = GeoAdapter::new();
        let inside = adapter
            .point_in_polygon(LatLng::new(60.0, 120.0), &rect(0.0, 0.0, 10.0, 10.0))
            .unwrap();
        assert!(!inside);
    }

    #[test]
    fn test_point_on_boundary_is_inside() {
        let adapter = GeoAdapter::new();
        let inside = adapter
            .point_in_polygon(LatLng::new(5.0, 0.0), &rect(0.0, 0.0, 10.0, 10.0))
            .unwrap();
        assert!(inside);
    }

    #[test]
    fn test_point_in_hole_is_outside() {
        let adapter = GeoAdapter::new();
        let mut donut = rect(0.0, 0.0, 10.0, 10.0);
        donut.extend(rect(4.0, 4.0, 6.0, 6.0));

        assert!(!adapter.point_in_polygon(LatLng::new(5.0, 5.0), &donut).unwrap());
        assert!(adapter.point_in_polygon(LatLng::new(1.0, 1.0), &donut).unwrap());
    }

    #[test]
    fn test_point_in_multi_polygon_second_member() {
        let adapter = GeoAdapter::new();
        let multi = vec![rect(0.0, 0.0, 1.0, 1.0), rect(20.0, 20.0, 30.0, 30.0)];

        // Only inside B
        assert!(
            adapter
                .point_in_multi_polygon(LatLng::new(25.0, 25.0), &multi)
                .unwrap()
        );
        assert!(
            !adapter
                .point_in_multi_polygon(LatLng::new(10.0, 10.0), &multi)
                .unwrap()
        );
    }

    #[test]
    fn test_multi_polygon_short_circuits() {
        let adapter = GeoAdapter::new();
        // The second member is malformed but never evaluated.
        let multi = vec![rect(0.0, 0.0, 10.0, 10.0), vec![vec![Position::new(0.0, 0.0)]]];

        assert!(
            adapter
                .point_in_multi_polygon(LatLng::new(5.0, 5.0), &multi)
                .unwrap()
        );
        assert!(
            adapter
                .point_in_multi_polygon(LatLng::new(50.0, 50.0), &multi)
                .is_err()
        );
    }

    #[test]
    fn test_invalid_point_rejected() {
        let adapter = GeoAdapter::new();
        let err = adapter
            .point_in_polygon(LatLng::new(95.0, 0.0), &rect(0.0, 0.0, 10.0, 10.0))
            .unwrap_err();
        assert!(matches!(err, GeometryError::InvalidCoordinates { .. }));
    }

    #[test]
    fn test_distance_units() {
        let adapter = GeoAdapter::new();
        let paris = LatLng::new(48.8566, 2.3522);
        let london = LatLng::new(51.5074, -0.1278);

        let km = adapter
            .distance(paris, london, DistanceUnit::Kilometers)
            .unwrap();
        assert!((km - 343.5).abs() < 2.0, "got {km}");

        let meters = adapter.distance(paris, london, DistanceUnit::Meters).unwrap();
        assert!((meters / 1_000.0 - km).abs() < 1e-9);

        let miles = adapter.distance(paris, london, DistanceUnit::Miles).unwrap();
        assert!(miles < km);
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let adapter = GeoAdapter::new();
        let point = LatLng::new(-23.55, -46.63);
        assert_eq!(
            adapter
                .distance(point, point, DistanceUnit::Kilometers)
                .unwrap(),
            0.0
        );
    }

    #[test]
    fn test_bbox() {
        let adapter = GeoAdapter::new();
        let geometry = Geometry::MultiPolygon(vec![
            rect(-10.0, -5.0, 0.0, 0.0),
            rect(5.0, 2.0, 8.0, 12.0),
        ]);

        let bbox = adapter.bbox(&geometry).unwrap();
        assert_eq!(bbox, BoundingBox([-10.0, -5.0, 8.0, 12.0]));
        assert_eq!(bbox.min_x(), -10.0);
        assert_eq!(bbox.max_y(), 12.0);
    }

    #[test]
    fn test_centroid_of_square() {
        let adapter = GeoAdapter::new();
        let centroid = adapter
            .centroid(&Geometry::Polygon(rect(0.0, 0.0, 10.0, 20.0)))
            .unwrap();

        assert!((centroid.lng - 5.0).abs() < 1e-9);
        assert!((centroid.lat - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_geometry_never_contains() {
        let adapter = GeoAdapter::new();
        let geometry = Geometry::Point(Position::new(1.0, 1.0));
        assert!(!adapter.contains(LatLng::new(1.0, 1.0), &geometry).unwrap());
    }
}
