//! Footprint geometry decoding.
//!
//! Raw geometry cells arrive either as WKT text (CSV exports) or as WKB bytes
//! (GeoParquet). Both are decoded with geozero into `geo::Geometry` and then
//! narrowed to [`Footprint`], which only admits polygonal shapes.

use geo::{Coord, Geometry, MultiPolygon, Polygon};
use geozero::wkb::Wkb;
use geozero::wkt::Wkt;
use geozero::ToGeo;

/// Errors produced while turning a raw geometry cell into a [`Footprint`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("WKT decode error: {0}")]
    Wkt(String),

    #[error("WKB decode error: {0}")]
    Wkb(String),

    #[error("unsupported geometry type: {0}")]
    Unsupported(&'static str),
}

/// Decode a WKT string into a geometry.
pub fn decode_wkt(text: &str) -> Result<Geometry<f64>, GeometryError> {
    Wkt(text)
        .to_geo()
        .map_err(|e| GeometryError::Wkt(e.to_string()))
}

/// Decode WKB bytes into a geometry.
pub fn decode_wkb(bytes: &[u8]) -> Result<Geometry<f64>, GeometryError> {
    Wkb(bytes.to_vec())
        .to_geo()
        .map_err(|e| GeometryError::Wkb(e.to_string()))
}

/// Name of a geometry variant as it appears in WKT/GeoJSON.
pub fn geometry_kind(geom: &Geometry<f64>) -> &'static str {
    match geom {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// A building footprint: the only geometry shapes that are tiled.
#[derive(Debug, Clone, PartialEq)]
pub enum Footprint {
    Polygon(Polygon<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

impl Footprint {
    /// The vertex used to place this footprint on the grid.
    ///
    /// This is the first coordinate of the first exterior ring (of the first
    /// polygon for multipolygons). It is a structural pick, not a centroid:
    /// it is only guaranteed to be one of the footprint's own vertices.
    /// Returns `None` when that ring has no coordinates.
    pub fn anchor_vertex(&self) -> Option<Coord<f64>> {
        match self {
            Footprint::Polygon(poly) => poly.exterior().0.first().copied(),
            Footprint::MultiPolygon(mp) => mp
                .0
                .first()
                .and_then(|poly| poly.exterior().0.first().copied()),
        }
    }

    /// GeoJSON type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Footprint::Polygon(_) => "Polygon",
            Footprint::MultiPolygon(_) => "MultiPolygon",
        }
    }

    /// Total number of coordinates across all rings.
    pub fn coord_count(&self) -> usize {
        fn polygon_coords(poly: &Polygon<f64>) -> usize {
            poly.exterior().0.len() + poly.interiors().iter().map(|r| r.0.len()).sum::<usize>()
        }

        match self {
            Footprint::Polygon(poly) => polygon_coords(poly),
            Footprint::MultiPolygon(mp) => mp.0.iter().map(polygon_coords).sum(),
        }
    }

    /// Number of rings (exterior plus holes).
    pub fn ring_count(&self) -> usize {
        match self {
            Footprint::Polygon(poly) => 1 + poly.interiors().len(),
            Footprint::MultiPolygon(mp) => mp.0.iter().map(|p| 1 + p.interiors().len()).sum(),
        }
    }
}

impl TryFrom<Geometry<f64>> for Footprint {
    type Error = GeometryError;

    fn try_from(geom: Geometry<f64>) -> Result<Self, Self::Error> {
        match geom {
            Geometry::Polygon(poly) => Ok(Footprint::Polygon(poly)),
            Geometry::MultiPolygon(mp) => Ok(Footprint::MultiPolygon(mp)),
            other => Err(GeometryError::Unsupported(geometry_kind(&other))),
        }
    }
}

impl From<&Footprint> for geojson::Geometry {
    fn from(footprint: &Footprint) -> Self {
        let value = match footprint {
            Footprint::Polygon(poly) => geojson::Value::from(poly),
            Footprint::MultiPolygon(mp) => geojson::Value::from(mp),
        };
        geojson::Geometry::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use geozero::{CoordDimensions, ToWkb};

    const SQUARE_WKT: &str = "POLYGON((0.01 0.01, 0.02 0.01, 0.02 0.02, 0.01 0.02, 0.01 0.01))";

    // ========================================================================
    // Decoding
    // ========================================================================

    #[test]
    fn test_decode_wkt_polygon() {
        let geom = decode_wkt(SQUARE_WKT).expect("valid WKT");
        match geom {
            Geometry::Polygon(poly) => {
                assert_eq!(poly.exterior().0.len(), 5);
                assert!((poly.exterior().0[0].x - 0.01).abs() < 1e-12);
            }
            other => panic!("Expected Polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_wkt_multipolygon() {
        let wkt = "MULTIPOLYGON(((1 1, 2 1, 2 2, 1 1)), ((5 5, 6 5, 6 6, 5 5)))";
        let geom = decode_wkt(wkt).expect("valid WKT");
        assert!(matches!(geom, Geometry::MultiPolygon(ref mp) if mp.0.len() == 2));
    }

    #[test]
    fn test_decode_wkt_invalid() {
        assert!(matches!(decode_wkt("INVALID"), Err(GeometryError::Wkt(_))));
        assert!(decode_wkt("").is_err());
        assert!(decode_wkt("POLYGON((0 0, 1 0").is_err());
    }

    #[test]
    fn test_decode_wkb_polygon() {
        let original = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 4.0, y: 0.0),
            (x: 4.0, y: 4.0),
            (x: 0.0, y: 0.0),
        ]);
        let bytes = original.to_wkb(CoordDimensions::xy()).unwrap();
        let restored = decode_wkb(&bytes).expect("valid WKB");
        assert!(matches!(restored, Geometry::Polygon(ref p) if p.exterior().0.len() == 4));
    }

    #[test]
    fn test_decode_wkb_invalid() {
        assert!(matches!(
            decode_wkb(&[0x00, 0x01, 0x02, 0x03]),
            Err(GeometryError::Wkb(_))
        ));
        assert!(decode_wkb(&[]).is_err());
    }

    // ========================================================================
    // Footprint narrowing
    // ========================================================================

    #[test]
    fn test_point_is_not_a_footprint() {
        let geom = decode_wkt("POINT(0.01 0.01)").unwrap();
        assert_eq!(
            Footprint::try_from(geom),
            Err(GeometryError::Unsupported("Point"))
        );
    }

    #[test]
    fn test_linestring_is_not_a_footprint() {
        let geom = decode_wkt("LINESTRING(0 0, 1 1)").unwrap();
        assert_eq!(
            Footprint::try_from(geom),
            Err(GeometryError::Unsupported("LineString"))
        );
    }

    #[test]
    fn test_polygon_anchor_is_first_exterior_vertex() {
        let footprint = Footprint::try_from(decode_wkt(SQUARE_WKT).unwrap()).unwrap();
        let anchor = footprint.anchor_vertex().unwrap();
        assert_eq!((anchor.x, anchor.y), (0.01, 0.01));
        assert_eq!(footprint.kind(), "Polygon");
        assert_eq!(footprint.coord_count(), 5);
        assert_eq!(footprint.ring_count(), 1);
    }

    #[test]
    fn test_multipolygon_anchor_uses_first_polygon() {
        let wkt = "MULTIPOLYGON(((-3 -3, -2 -3, -2 -2, -3 -3)), ((5 5, 6 5, 6 6, 5 5)))";
        let footprint = Footprint::try_from(decode_wkt(wkt).unwrap()).unwrap();
        let anchor = footprint.anchor_vertex().unwrap();
        assert_eq!((anchor.x, anchor.y), (-3.0, -3.0));
        assert_eq!(footprint.kind(), "MultiPolygon");
        assert_eq!(footprint.ring_count(), 2);
    }

    #[test]
    fn test_empty_multipolygon_has_no_anchor() {
        let footprint = Footprint::MultiPolygon(MultiPolygon::new(vec![]));
        assert!(footprint.anchor_vertex().is_none());
        assert_eq!(footprint.coord_count(), 0);
    }

    #[test]
    fn test_geojson_geometry_shape() {
        let footprint = Footprint::try_from(decode_wkt(SQUARE_WKT).unwrap()).unwrap();
        let geometry = geojson::Geometry::from(&footprint);
        let json = serde_json::to_value(&geometry).unwrap();

        assert_eq!(json["type"], "Polygon");
        assert_eq!(json["coordinates"][0][0][0], 0.01);
        assert_eq!(json["coordinates"][0].as_array().unwrap().len(), 5);
    }
}
