//! Extent containment.
//!
//! The previous extent is treated as a closed polygon (its four corners) and
//! each corner of the requested extent is tested with the crossing-number
//! algorithm. Points lying on the polygon boundary count as inside, which makes
//! the test reflexive.

use crate::bounds::{BoundingBox, LonLat};

const EDGE_EPSILON: f64 = 1e-9;

/// Returns `true` when every corner of `next` lies within `previous`.
pub fn contains_extent(previous: &BoundingBox, next: &BoundingBox) -> bool {
    let ring = previous.corners();
    next.corners()
        .iter()
        .all(|corner| point_in_polygon(*corner, &ring))
}

/// Crossing-number point-in-polygon test over a closed ring.
///
/// The ring is implicitly closed (last vertex connects to the first).
pub fn point_in_polygon(p: LonLat, ring: &[LonLat]) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[j];

        if on_segment(p, a, b) {
            return true;
        }

        if (a.lat > p.lat) != (b.lat > p.lat) {
            let x_cross = (b.lon - a.lon) * (p.lat - a.lat) / (b.lat - a.lat) + a.lon;
            if p.lon < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(p: LonLat, a: LonLat, b: LonLat) -> bool {
    let cross = (b.lon - a.lon) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lon - a.lon);
    if cross.abs() > EDGE_EPSILON {
        return false;
    }
    p.lon >= a.lon.min(b.lon) - EDGE_EPSILON
        && p.lon <= a.lon.max(b.lon) + EDGE_EPSILON
        && p.lat >= a.lat.min(b.lat) - EDGE_EPSILON
        && p.lat <= a.lat.max(b.lat) + EDGE_EPSILON
}
