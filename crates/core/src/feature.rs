//! Building features: one decoded footprint plus its attributes.
//!
//! [`build_feature`] turns a raw [`Row`] into a [`BuildingFeature`] and its
//! anchor vertex, or explains with a [`DropReason`] why the row is skipped.
//! Dropping is never an error for the run; callers count the reasons in
//! [`DropCounts`].

use geo::Coord;
use geojson::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::geometry::{decode_wkb, decode_wkt, Footprint, GeometryError};
use crate::reader::{RawGeometry, Row, AREA_COLUMN, CONFIDENCE_COLUMN, PLUS_CODE_COLUMN};

/// Attributes carried into every tile feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingProperties {
    pub area_in_meters: f64,
    pub confidence: f64,
    pub full_plus_code: String,
}

/// A footprint ready to be placed in a grid cell.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildingFeature {
    /// Input row the feature was built from
    pub index: usize,
    pub geometry: Footprint,
    pub properties: BuildingProperties,
}

impl BuildingFeature {
    /// See [`Footprint::anchor_vertex`].
    pub fn anchor_vertex(&self) -> Option<Coord<f64>> {
        self.geometry.anchor_vertex()
    }

    /// Convert to a GeoJSON feature (`type`, `geometry`, `properties`).
    pub fn to_geojson(&self) -> geojson::Feature {
        let mut properties = JsonObject::new();
        properties.insert(
            AREA_COLUMN.to_string(),
            JsonValue::from(self.properties.area_in_meters),
        );
        properties.insert(
            CONFIDENCE_COLUMN.to_string(),
            JsonValue::from(self.properties.confidence),
        );
        properties.insert(
            PLUS_CODE_COLUMN.to_string(),
            JsonValue::from(self.properties.full_plus_code.clone()),
        );

        geojson::Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::from(&self.geometry)),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        }
    }
}

/// Why a row did not become a feature.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DropReason {
    #[error("geometry is missing")]
    MissingGeometry,

    #[error("geometry could not be decoded: {0}")]
    GeometryDecode(String),

    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(&'static str),

    #[error("invalid value in column {0}")]
    InvalidAttribute(&'static str),

    #[error("geometry has no usable anchor vertex")]
    DegenerateGeometry,

    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// Per-reason counters for dropped rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub missing_geometry: usize,
    pub geometry_decode: usize,
    pub unsupported_geometry: usize,
    pub invalid_attribute: usize,
    pub degenerate_geometry: usize,
    pub malformed_record: usize,
}

impl DropCounts {
    /// Count one dropped row.
    pub fn record(&mut self, reason: &DropReason) {
        match reason {
            DropReason::MissingGeometry => self.missing_geometry += 1,
            DropReason::GeometryDecode(_) => self.geometry_decode += 1,
            DropReason::UnsupportedGeometry(_) => self.unsupported_geometry += 1,
            DropReason::InvalidAttribute(_) => self.invalid_attribute += 1,
            DropReason::DegenerateGeometry => self.degenerate_geometry += 1,
            DropReason::MalformedRecord(_) => self.malformed_record += 1,
        }
    }

    /// Add another set of counters into this one.
    pub fn add(&mut self, other: &DropCounts) {
        self.missing_geometry += other.missing_geometry;
        self.geometry_decode += other.geometry_decode;
        self.unsupported_geometry += other.unsupported_geometry;
        self.invalid_attribute += other.invalid_attribute;
        self.degenerate_geometry += other.degenerate_geometry;
        self.malformed_record += other.malformed_record;
    }

    /// Total rows dropped for any reason.
    pub fn total(&self) -> usize {
        self.missing_geometry
            + self.geometry_decode
            + self.unsupported_geometry
            + self.invalid_attribute
            + self.degenerate_geometry
            + self.malformed_record
    }
}

/// Build a feature from one row and return it with its anchor vertex.
pub fn build_feature(row: &Row) -> Result<(BuildingFeature, Coord<f64>), DropReason> {
    if let Some(problem) = &row.malformed {
        return Err(DropReason::MalformedRecord(problem.clone()));
    }

    let decoded = match &row.geometry {
        RawGeometry::Wkt(text) => decode_wkt(text),
        RawGeometry::Wkb(bytes) => decode_wkb(bytes),
        RawGeometry::Missing => return Err(DropReason::MissingGeometry),
    }
    .map_err(|e| DropReason::GeometryDecode(e.to_string()))?;

    let geometry = Footprint::try_from(decoded).map_err(|e| match e {
        GeometryError::Unsupported(kind) => DropReason::UnsupportedGeometry(kind),
        other => DropReason::GeometryDecode(other.to_string()),
    })?;

    let properties = BuildingProperties {
        area_in_meters: row
            .area_in_meters
            .as_f64()
            .ok_or(DropReason::InvalidAttribute(AREA_COLUMN))?,
        confidence: row
            .confidence
            .as_f64()
            .ok_or(DropReason::InvalidAttribute(CONFIDENCE_COLUMN))?,
        full_plus_code: row
            .full_plus_code
            .as_text()
            .ok_or(DropReason::InvalidAttribute(PLUS_CODE_COLUMN))?,
    };

    let anchor = geometry
        .anchor_vertex()
        .filter(|c| c.x.is_finite() && c.y.is_finite())
        .ok_or(DropReason::DegenerateGeometry)?;

    Ok((
        BuildingFeature {
            index: row.index,
            geometry,
            properties,
        },
        anchor,
    ))
}
