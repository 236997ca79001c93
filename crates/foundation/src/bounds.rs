use serde::{Deserialize, Serialize};

/// A WGS84 position in degrees.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Geographic extent as reported by the map: `north, west, south, east` in degrees.
///
/// The box is stored exactly as received. `west > east` is not rejected; range
/// helpers order the edges, so such a box is read as the span between them.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn new(north: f64, west: f64, south: f64, east: f64) -> Self {
        Self {
            north,
            west,
            south,
            east,
        }
    }

    pub fn world() -> Self {
        Self::new(90.0, -180.0, -90.0, 180.0)
    }

    /// Corners in ring order: north-west, north-east, south-east, south-west.
    pub fn corners(&self) -> [LonLat; 4] {
        [
            LonLat::new(self.west, self.north),
            LonLat::new(self.east, self.north),
            LonLat::new(self.east, self.south),
            LonLat::new(self.west, self.south),
        ]
    }

    /// `(min_lon, max_lon)`.
    pub fn lon_range(&self) -> (f64, f64) {
        (self.west.min(self.east), self.west.max(self.east))
    }

    /// `(min_lat, max_lat)`.
    pub fn lat_range(&self) -> (f64, f64) {
        (self.south.min(self.north), self.south.max(self.north))
    }

    pub fn center(&self) -> LonLat {
        let (min_lon, max_lon) = self.lon_range();
        let (min_lat, max_lat) = self.lat_range();
        LonLat::new((min_lon + max_lon) / 2.0, (min_lat + max_lat) / 2.0)
    }

    pub fn contains_point(&self, p: LonLat) -> bool {
        let (min_lon, max_lon) = self.lon_range();
        let (min_lat, max_lat) = self.lat_range();
        p.lon >= min_lon && p.lon <= max_lon && p.lat >= min_lat && p.lat <= max_lat
    }

    /// Clamp to valid WGS84 ranges, ordering the edges.
    pub fn clamped(&self) -> Self {
        let (min_lon, max_lon) = self.lon_range();
        let (min_lat, max_lat) = self.lat_range();
        Self::new(
            max_lat.clamp(-90.0, 90.0),
            min_lon.clamp(-180.0, 180.0),
            min_lat.clamp(-90.0, 90.0),
            max_lon.clamp(-180.0, 180.0),
        )
    }

    /// Overlapping region of two boxes, or `None` when they are disjoint.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let (a_min_lon, a_max_lon) = self.lon_range();
        let (a_min_lat, a_max_lat) = self.lat_range();
        let (b_min_lon, b_max_lon) = other.lon_range();
        let (b_min_lat, b_max_lat) = other.lat_range();

        let west = a_min_lon.max(b_min_lon);
        let east = a_max_lon.min(b_max_lon);
        let south = a_min_lat.max(b_min_lat);
        let north = a_max_lat.min(b_max_lat);

        if west > east || south > north {
            return None;
        }
        Some(BoundingBox::new(north, west, south, east))
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.intersection(other).is_some()
    }
}
