//! Region identification.
//!
//! [`identify_region`] scans features in the order supplied and returns the
//! first one whose geometry contains the point. Overlapping or touching
//! regions therefore resolve to whichever comes first in the input. Both the
//! execution context and degraded mode go through this single function.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use geobroker_common::GeometryError;

use crate::adapter::GeometryAdapter;
use crate::geometry::{Feature, LatLng};

/// Property keys consulted for the region identifier, in priority order.
pub const ID_PROPERTIES: [&str; 4] = ["ISO_A3", "ADM0_A3", "ISO3", "ISO_A2"];

/// Property keys consulted for the display name, in priority order.
pub const NAME_PROPERTIES: [&str; 4] = ["name", "NAME", "NAME_EN", "ADMIN"];

/// Identifier reported when no id property is present.
pub const UNKNOWN_ID: &str = "UNK";

/// Name reported when no name property is present.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Outcome of an identify request.
///
/// "Not found" is a normal outcome (`matched == false`), not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionMatch {
    /// Whether any feature contained the point.
    pub matched: bool,

    /// Identifier of the matched region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,

    /// Display name of the matched region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,

    /// The matched feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<Feature>,
}

impl RegionMatch {
    /// A result for a point outside every feature.
    pub fn not_found() -> Self {
        Self {
            matched: false,
            region_id: None,
            region_name: None,
            feature: None,
        }
    }

    /// A result for a point inside `feature`.
    pub fn found(feature: &Feature) -> Self {
        Self {
            matched: true,
            region_id: Some(region_id(feature)),
            region_name: Some(region_name(feature)),
            feature: Some(feature.clone()),
        }
    }
}

/// Resolve a feature's region identifier.
///
/// Falls back through [`ID_PROPERTIES`], then the GeoJSON feature `id`,
/// then [`UNKNOWN_ID`].
pub fn region_id(feature: &Feature) -> String {
    if let Some(id) = ID_PROPERTIES
        .iter()
        .find_map(|key| feature.property_str(key))
    {
        return id.to_string();
    }
    match &feature.id {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => UNKNOWN_ID.to_string(),
    }
}

/// Resolve a feature's display name.
pub fn region_name(feature: &Feature) -> String {
    NAME_PROPERTIES
        .iter()
        .find_map(|key| feature.property_str(key))
        .unwrap_or(UNKNOWN_NAME)
        .to_string()
}

/// Return the first feature, in input order, whose geometry contains `point`.
pub fn identify_region(
    adapter: &dyn GeometryAdapter,
    point: LatLng,
    features: &[Feature],
) -> Result<RegionMatch, GeometryError> {
    point.validate()?;
    for feature in features {
        if adapter.contains(point, &feature.geometry)? {
            return Ok(RegionMatch::found(feature));
        }
    }
    Ok(RegionMatch::not_found())
}
