use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bounds::BoundingBox;
use crate::geohash;

/// Tile coordinate in ZXY scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Geographic bounds of this tile in WGS84.
    pub fn bounds(&self) -> BoundingBox {
        let n = (1u64 << self.z) as f64;
        let west = (self.x as f64 / n) * 360.0 - 180.0;
        let east = ((self.x + 1) as f64 / n) * 360.0 - 180.0;

        // Web Mercator Y flip
        let north = tile_y_to_lat(self.y, self.z);
        let south = tile_y_to_lat(self.y + 1, self.z);

        BoundingBox::new(north, west, south, east)
    }
}

fn tile_y_to_lat(y: u32, z: u8) -> f64 {
    let n = std::f64::consts::PI - 2.0 * std::f64::consts::PI * (y as f64) / (1u64 << z) as f64;
    n.sinh().atan().to_degrees()
}

/// Spatial partition at the active precision. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileKey {
    Geohash(String),
    Xyz(TileCoord),
}

impl TileKey {
    pub fn geohash(hash: impl Into<String>) -> Self {
        Self::Geohash(hash.into())
    }

    pub fn xyz(z: u8, x: u32, y: u32) -> Self {
        Self::Xyz(TileCoord::new(z, x, y))
    }

    /// Geographic bounds; `None` for a malformed geohash.
    pub fn bounds(&self) -> Option<BoundingBox> {
        match self {
            Self::Geohash(hash) => geohash::decode_bbox(hash),
            Self::Xyz(coord) => Some(coord.bounds()),
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Geohash(hash) => write!(f, "{hash}"),
            Self::Xyz(c) => write!(f, "{}/{}/{}", c.z, c.x, c.y),
        }
    }
}
