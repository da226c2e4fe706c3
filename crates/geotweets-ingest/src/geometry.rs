//! Geometry adapter
//!
//! Turns GeoJSON-shaped descriptors (`{"type": "Point", "coordinates": [x, y]}`)
//! into hex-encoded little-endian WKB. Parsing is done by `geojson`, encoding
//! by `geozero`. Place bounding boxes arrive as four-corner polygons without
//! the closing position; `geo_types::Polygon::new` closes the rings.
//!
//! No reference system is attached. The Postgres sink applies SRID 4326.

use geo_types::Geometry;
use geojson::{PolygonType, Position, Value as Shape};
use geozero::{CoordDimensions, ToWkb};
use serde_json::Value;
use thiserror::Error;

use geotweets_common::types::EncodedGeometry;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("geometry is missing")]
    Missing,

    #[error("malformed geometry: {0}")]
    Malformed(String),

    #[error("unsupported geometry type `{0}`")]
    Unsupported(String),
}

type GeometryResult<T> = std::result::Result<T, GeometryError>;

/// Encode a shape descriptor as hex WKB
pub fn encode_geometry(shape: Option<&Value>) -> GeometryResult<EncodedGeometry> {
    let geometry = parse_shape(shape)?;
    let wkb = geometry
        .to_wkb(CoordDimensions::xy())
        .map_err(|e| GeometryError::Malformed(e.to_string()))?;
    Ok(EncodedGeometry::new(hex::encode_upper(wkb)))
}

/// Parse a GeoJSON-like descriptor into a `geo_types` geometry
pub fn parse_shape(shape: Option<&Value>) -> GeometryResult<Geometry<f64>> {
    let shape = match shape {
        None | Some(Value::Null) => return Err(GeometryError::Missing),
        Some(shape) => shape,
    };

    let parsed = geojson::Geometry::from_json_value(shape.clone()).map_err(|e| match e {
        geojson::Error::GeometryUnknownType(kind) => GeometryError::Unsupported(kind),
        other => GeometryError::Malformed(other.to_string()),
    })?;
    check_shape(&parsed.value)?;

    Geometry::try_from(parsed).map_err(|e| GeometryError::Malformed(e.to_string()))
}

/// Reject shapes `geojson` accepts but WKB cannot carry sensibly
fn check_shape(shape: &Shape) -> GeometryResult<()> {
    match shape {
        Shape::Point(p) => position(p),
        Shape::MultiPoint(points) => points.iter().try_for_each(position),
        Shape::LineString(line) => {
            if line.len() < 2 {
                return Err(GeometryError::Malformed(
                    "LineString needs at least 2 positions".to_string(),
                ));
            }
            line.iter().try_for_each(position)
        },
        Shape::Polygon(rings) => polygon(rings),
        Shape::MultiPolygon(polygons) => {
            if polygons.is_empty() {
                return Err(GeometryError::Malformed("empty MultiPolygon".to_string()));
            }
            polygons.iter().try_for_each(|rings| polygon(rings))
        },
        Shape::MultiLineString(_) => Err(GeometryError::Unsupported("MultiLineString".to_string())),
        Shape::GeometryCollection(_) => {
            Err(GeometryError::Unsupported("GeometryCollection".to_string()))
        },
    }
}

fn position(p: &Position) -> GeometryResult<()> {
    if p.len() < 2 {
        return Err(GeometryError::Malformed(format!(
            "position needs 2 ordinates, found {}",
            p.len()
        )));
    }
    if p.iter().any(|v| !v.is_finite()) {
        return Err(GeometryError::Malformed("non-finite ordinate".to_string()));
    }
    Ok(())
}

fn polygon(rings: &PolygonType) -> GeometryResult<()> {
    if rings.is_empty() {
        return Err(GeometryError::Malformed("Polygon has no rings".to_string()));
    }
    for ring in rings {
        if ring.len() < 3 {
            return Err(GeometryError::Malformed(format!(
                "ring needs at least 3 positions, found {}",
                ring.len()
            )));
        }
        ring.iter().try_for_each(position)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_point_matches_reference_wkb() {
        let shape = json!({"type": "Point", "coordinates": [1, 2]});
        let encoded = encode_geometry(Some(&shape)).unwrap();
        assert_eq!(
            encoded.as_str(),
            "0101000000000000000000F03F0000000000000040"
        );
    }

    #[test]
    fn test_bounding_box_ring_is_closed() {
        let shape = json!({
            "type": "Polygon",
            "coordinates": [[[-74.0, 40.0], [-74.0, 41.0], [-73.0, 41.0], [-73.0, 40.0]]]
        });
        let Geometry::Polygon(poly) = parse_shape(Some(&shape)).unwrap() else {
            panic!("expected polygon");
        };
        assert_eq!(poly.exterior().0.len(), 5);
        assert_eq!(poly.exterior().0.first(), poly.exterior().0.last());

        let encoded = encode_geometry(Some(&shape)).unwrap();
        // header (5) + ring count (4) + point count (4) + 5 points * 16
        assert_eq!(encoded.as_str().len(), (5 + 4 + 4 + 5 * 16) * 2);
        assert!(encoded.as_str().starts_with("0103000000"));
    }

    #[test]
    fn test_multipolygon_nests_headers() {
        let square = json!([[[0, 0], [0, 1], [1, 1], [1, 0], [0, 0]]]);
        let shape = json!({"type": "MultiPolygon", "coordinates": [square.clone(), square]});
        let encoded = encode_geometry(Some(&shape)).unwrap();
        assert!(encoded.as_str().starts_with("010600000002000000"));
    }

    #[test]
    fn test_missing_geometry() {
        assert_eq!(encode_geometry(None), Err(GeometryError::Missing));
        assert_eq!(encode_geometry(Some(&Value::Null)), Err(GeometryError::Missing));
    }

    #[test]
    fn test_malformed_geometry() {
        let cases = [
            json!({"coordinates": [1, 2]}),
            json!({"type": "Point"}),
            json!({"type": "Point", "coordinates": [1]}),
            json!({"type": "Point", "coordinates": ["a", 2]}),
            json!({"type": "Polygon", "coordinates": [[[0, 0], [1, 1]]]}),
            json!({"type": "Polygon", "coordinates": []}),
            json!({"type": "LineString", "coordinates": [[0, 0]]}),
            json!([1, 2]),
        ];
        for case in cases {
            assert!(
                matches!(encode_geometry(Some(&case)), Err(GeometryError::Malformed(_))),
                "{} should be malformed",
                case
            );
        }
    }

    #[test]
    fn test_unsupported_type() {
        let shape = json!({"type": "Circle", "coordinates": [0, 0]});
        assert_eq!(
            encode_geometry(Some(&shape)),
            Err(GeometryError::Unsupported("Circle".to_string()))
        );

        let collection = json!({"type": "GeometryCollection", "geometries": []});
        assert!(matches!(
            encode_geometry(Some(&collection)),
            Err(GeometryError::Unsupported(_))
        ));
    }

    #[test]
    fn test_linestring_and_multipoint() {
        let line = json!({"type": "LineString", "coordinates": [[0, 0], [1, 1]]});
        assert!(encode_geometry(Some(&line)).unwrap().as_str().starts_with("0102000000"));

        let points = json!({"type": "MultiPoint", "coordinates": [[0, 0], [1, 1]]});
        assert!(encode_geometry(Some(&points))
            .unwrap()
            .as_str()
            .starts_with("010400000002000000"));
    }
}
