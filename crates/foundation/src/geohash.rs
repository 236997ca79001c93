//! Geohash encoding and extent covering.
//!
//! Standard base32 geohash: bits alternate longitude/latitude starting with
//! longitude, five bits per character.

use std::collections::BTreeSet;

use crate::bounds::{BoundingBox, LonLat};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest geohash this crate produces.
pub const MAX_PRECISION: u8 = 12;

fn decode_char(c: u8) -> Option<u8> {
    BASE32.iter().position(|b| *b == c).map(|i| i as u8)
}

fn bit_split(precision: u8) -> (u32, u32) {
    let bits = 5 * u32::from(precision);
    let lon_bits = bits.div_ceil(2);
    let lat_bits = bits / 2;
    (lon_bits, lat_bits)
}

/// Width and height in degrees of one cell at `precision`.
pub fn cell_size(precision: u8) -> (f64, f64) {
    let (lon_bits, lat_bits) = bit_split(precision);
    (
        360.0 / 2f64.powi(lon_bits as i32),
        180.0 / 2f64.powi(lat_bits as i32),
    )
}

pub fn encode(p: LonLat, precision: u8) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);
    let mut lon = (-180.0f64, 180.0f64);
    let mut lat = (-90.0f64, 90.0f64);
    let mut out = String::with_capacity(precision as usize);

    let mut even = true;
    let mut bit = 0;
    let mut ch = 0usize;
    while out.len() < precision as usize {
        let (range, value) = if even {
            (&mut lon, p.lon)
        } else {
            (&mut lat, p.lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        if value >= mid {
            ch = (ch << 1) | 1;
            range.0 = mid;
        } else {
            ch <<= 1;
            range.1 = mid;
        }
        even = !even;

        bit += 1;
        if bit == 5 {
            out.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }
    out
}

/// Bounds of the cell named by `hash`, or `None` for an invalid geohash.
pub fn decode_bbox(hash: &str) -> Option<BoundingBox> {
    if hash.is_empty() {
        return None;
    }
    let mut lon = (-180.0f64, 180.0f64);
    let mut lat = (-90.0f64, 90.0f64);
    let mut even = true;

    for c in hash.bytes() {
        let v = decode_char(c.to_ascii_lowercase())?;
        for shift in (0..5).rev() {
            let set = (v >> shift) & 1 == 1;
            let range = if even { &mut lon } else { &mut lat };
            let mid = (range.0 + range.1) / 2.0;
            if set {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even = !even;
        }
    }

    Some(BoundingBox::new(lat.1, lon.0, lat.0, lon.1))
}

pub fn decode_center(hash: &str) -> Option<LonLat> {
    decode_bbox(hash).map(|b| b.center())
}

/// Row and column ranges of the cells at `precision` that intersect `extent`.
struct Grid {
    cell_w: f64,
    cell_h: f64,
    rows: (u64, u64),
    cols: (u64, u64),
}

impl Grid {
    fn new(extent: &BoundingBox, precision: u8) -> Self {
        let extent = extent.clamped();
        let (cell_w, cell_h) = cell_size(precision);
        let (lon_bits, lat_bits) = bit_split(precision);
        let max_col = (1u64 << lon_bits) - 1;
        let max_row = (1u64 << lat_bits) - 1;

        let col = |lon: f64| (((lon + 180.0) / cell_w).floor().max(0.0) as u64).min(max_col);
        let row = |lat: f64| (((lat + 90.0) / cell_h).floor().max(0.0) as u64).min(max_row);
        Self {
            cell_w,
            cell_h,
            rows: (row(extent.south), row(extent.north)),
            cols: (col(extent.west), col(extent.east)),
        }
    }

    fn len(&self) -> u64 {
        (self.rows.1 - self.rows.0 + 1) * (self.cols.1 - self.cols.0 + 1)
    }
}

/// All geohash cells of length `precision` that intersect `extent`.
///
/// Cells touching the extent only along an edge are included, so adjacent
/// extents share their boundary cells.
pub fn cover(extent: &BoundingBox, precision: u8) -> BTreeSet<String> {
    let precision = precision.clamp(1, MAX_PRECISION);
    let grid = Grid::new(extent, precision);

    let mut out = BTreeSet::new();
    for r in grid.rows.0..=grid.rows.1 {
        for c in grid.cols.0..=grid.cols.1 {
            let center = LonLat::new(
                -180.0 + (c as f64 + 0.5) * grid.cell_w,
                -90.0 + (r as f64 + 0.5) * grid.cell_h,
            );
            out.insert(encode(center, precision));
        }
    }
    out
}

/// Number of cells [`cover`] would return, computed without building them.
pub fn cover_len(extent: &BoundingBox, precision: u8) -> u64 {
    Grid::new(extent, precision.clamp(1, MAX_PRECISION)).len()
}

/// Finest precision, at most `finest`, whose cover of `extent` has no more
/// than `max_cells` cells. Precision 1 when none fits.
pub fn fitting_precision(extent: &BoundingBox, finest: u8, max_cells: u64) -> u8 {
    (1..=finest.clamp(1, MAX_PRECISION))
        .rev()
        .find(|p| cover_len(extent, *p) <= max_cells)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::{cell_size, cover, cover_len, decode_bbox, decode_center, encode, fitting_precision};
    use crate::bounds::{BoundingBox, LonLat};

    #[test]
    fn encodes_known_points() {
        // Reference values from the original geohash.org examples.
        assert_eq!(encode(LonLat::new(-5.6, 42.6), 5), "ezs42");
        assert_eq!(encode(LonLat::new(10.40744, 57.64911), 11), "u4pruydqqvj");
    }

    #[test]
    fn decoded_cell_contains_encoded_point() {
        let p = LonLat::new(2.3522, 48.8566);
        for precision in 1..=8 {
            let hash = encode(p, precision);
            let cell = decode_bbox(&hash).expect("valid hash");
            assert!(cell.contains_point(p), "{hash} should contain {p:?}");
            let (w, h) = cell_size(precision);
            assert!(((cell.east - cell.west) - w).abs() < 1e-9);
            assert!(((cell.north - cell.south) - h).abs() < 1e-9);
        }
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(decode_bbox("a").is_none());
        assert!(decode_bbox("").is_none());
        assert!(decode_center("u4").is_some());
    }

    #[test]
    fn world_cover_at_precision_one_is_every_cell() {
        let cells = cover(&BoundingBox::world(), 1);
        assert_eq!(cells.len(), 32);
    }

    #[test]
    fn cover_stays_within_extent_neighbourhood() {
        let extent = BoundingBox::new(1.0, 1.0, 0.5, 1.5);
        let cells = cover(&extent, 3);
        assert!(!cells.is_empty());
        for c in &cells {
            let b = decode_bbox(c).expect("valid");
            assert!(b.intersects(&extent), "{c} does not touch {extent:?}");
        }
    }

    #[test]
    fn cover_len_matches_cover() {
        let extent = BoundingBox::new(48.9, 2.3, 48.8, 2.4);
        for precision in 1..=6 {
            assert_eq!(cover_len(&extent, precision), cover(&extent, precision).len() as u64);
        }
    }

    #[test]
    fn fitting_precision_coarsens_large_extents() {
        // 1.3 by 0.5 degrees: over ten thousand cells at precision 6.
        let screen = BoundingBox::new(49.1, 1.7, 48.6, 3.0);
        assert!(cover_len(&screen, 6) > 10_000);
        let p = fitting_precision(&screen, 6, 64);
        assert_eq!(p, 4);
        assert!(cover_len(&screen, p) <= 64);

        let small = BoundingBox::new(48.86, 2.35, 48.85, 2.36);
        assert_eq!(fitting_precision(&small, 6, 64), 6);
        assert_eq!(fitting_precision(&BoundingBox::world(), 6, 8), 1);
    }
}
