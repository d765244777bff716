//! Geometry adapter seam and the built-in planar implementation.
//!
//! [`PlanarGeometry`] treats circles with great-circle distance and
//! projects polygons onto a local equirectangular plane centred on the
//! query point.  That is accurate to well under a metre at the scale of a
//! walkable soundscape (a few kilometres).

use std::f64::consts::PI;

use soundscape_core::{GeoPoint, ZoneGeometry, EARTH_RADIUS_M};

use crate::error::ZoneError;
use crate::spatial::Aabb;

const METRES_PER_DEG: f64 = EARTH_RADIUS_M * PI / 180.0;

/// Builds collision shapes from zone geometry and answers point queries.
pub trait GeometryAdapter: Send + Sync {
    type Shape: Send + Sync;

    fn build_shape(&self, geometry: &ZoneGeometry) -> Result<Self::Shape, ZoneError>;

    fn contains(&self, shape: &Self::Shape, point: &GeoPoint) -> bool;

    /// Distance in metres from `point` to the zone edge; `0.0` inside.
    fn distance_m(&self, shape: &Self::Shape, point: &GeoPoint) -> f64;

    /// Bounding box in degrees, used by the candidate index.
    fn bounds(&self, shape: &Self::Shape) -> Aabb;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanarShape {
    Disc { center: GeoPoint, radius_m: f64 },
    /// Closed ring without the repeated closing vertex.
    Ring(Vec<GeoPoint>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanarGeometry;

fn invalid(msg: impl Into<String>) -> ZoneError {
    ZoneError::InvalidGeometry(msg.into())
}

fn wrap_degrees(d: f64) -> f64 {
    let wrapped = (d + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && d > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Local east/north offset of `p` from `origin`, in metres.
fn project(origin: &GeoPoint, p: &GeoPoint) -> (f64, f64) {
    let x = wrap_degrees(p.lng - origin.lng) * origin.lat.to_radians().cos() * METRES_PER_DEG;
    let y = (p.lat - origin.lat) * METRES_PER_DEG;
    (x, y)
}

fn origin_distance_to_segment(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (-(a.0 * dx + a.1 * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (a.0 + t * dx, a.1 + t * dy);
    (cx * cx + cy * cy).sqrt()
}

fn ring_contains_origin(ring: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > 0.0) != (yj > 0.0) && 0.0 < (xj - xi) * (0.0 - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

impl PlanarGeometry {
    fn disc(center: &GeoPoint, radius_m: f64, allow_zero: bool) -> Result<PlanarShape, ZoneError> {
        if !center.is_finite() {
            return Err(invalid("non-finite centre"));
        }
        let radius_ok = radius_m.is_finite() && (radius_m > 0.0 || (allow_zero && radius_m == 0.0));
        if !radius_ok {
            return Err(invalid(format!("radius {radius_m}")));
        }
        Ok(PlanarShape::Disc { center: *center, radius_m })
    }

    fn ring(points: &[GeoPoint]) -> Result<PlanarShape, ZoneError> {
        let mut ring: Vec<GeoPoint> = points.to_vec();
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 {
            return Err(invalid(format!("polygon needs 3 vertices, got {}", ring.len())));
        }
        if ring.iter().any(|p| !p.is_finite()) {
            return Err(invalid("non-finite vertex"));
        }
        Ok(PlanarShape::Ring(ring))
    }

    fn projected(ring: &[GeoPoint], origin: &GeoPoint) -> Vec<(f64, f64)> {
        ring.iter().map(|p| project(origin, p)).collect()
    }
}

impl GeometryAdapter for PlanarGeometry {
    type Shape = PlanarShape;

    fn build_shape(&self, geometry: &ZoneGeometry) -> Result<PlanarShape, ZoneError> {
        match geometry {
            ZoneGeometry::Circle { center, radius_m } => Self::disc(center, *radius_m, false),
            ZoneGeometry::CircleMarker { center, radius_m } => Self::disc(center, *radius_m, true),
            ZoneGeometry::Rectangle { south_west, north_east } => {
                let (s, n) = (south_west.lat.min(north_east.lat), south_west.lat.max(north_east.lat));
                let (w, e) = (south_west.lng.min(north_east.lng), south_west.lng.max(north_east.lng));
                if s == n || w == e {
                    return Err(invalid("degenerate rectangle"));
                }
                Self::ring(&[
                    GeoPoint::new(s, w),
                    GeoPoint::new(s, e),
                    GeoPoint::new(n, e),
                    GeoPoint::new(n, w),
                ])
            }
            ZoneGeometry::Polygon { ring } => Self::ring(ring),
        }
    }

    fn contains(&self, shape: &PlanarShape, point: &GeoPoint) -> bool {
        match shape {
            PlanarShape::Disc { center, radius_m } => center.distance_m(point) <= *radius_m,
            PlanarShape::Ring(ring) => ring_contains_origin(&Self::projected(ring, point)),
        }
    }

    fn distance_m(&self, shape: &PlanarShape, point: &GeoPoint) -> f64 {
        match shape {
            PlanarShape::Disc { center, radius_m } => (center.distance_m(point) - radius_m).max(0.0),
            PlanarShape::Ring(ring) => {
                let projected = Self::projected(ring, point);
                if ring_contains_origin(&projected) {
                    return 0.0;
                }
                let n = projected.len();
                (0..n)
                    .map(|i| origin_distance_to_segment(projected[i], projected[(i + 1) % n]))
                    .fold(f64::INFINITY, f64::min)
            }
        }
    }

    fn bounds(&self, shape: &PlanarShape) -> Aabb {
        match shape {
            PlanarShape::Disc { center, radius_m } => {
                let dlat = radius_m / METRES_PER_DEG;
                let dlng = dlat / center.lat.to_radians().cos().max(1e-6);
                Aabb::around(center.lng, center.lat, dlng, dlat)
            }
            PlanarShape::Ring(ring) => ring.iter().fold(
                Aabb {
                    min_x: f64::INFINITY,
                    min_y: f64::INFINITY,
                    max_x: f64::NEG_INFINITY,
                    max_y: f64::NEG_INFINITY,
                },
                |b, p| Aabb {
                    min_x: b.min_x.min(p.lng),
                    min_y: b.min_y.min(p.lat),
                    max_x: b.max_x.max(p.lng),
                    max_y: b.max_y.max(p.lat),
                },
            ),
        }
    }
}

/// Degree extents of a box of half-size `metres` around `at`.
pub fn degree_extents(at: &GeoPoint, metres: f64) -> (f64, f64) {
    let dlat = metres / METRES_PER_DEG;
    let dlng = dlat / at.lat.to_radians().cos().max(1e-6);
    (dlng, dlat)
}
