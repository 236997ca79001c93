//! Zoom to partition precision.

/// Coarsest precision produced by [`precision_for_zoom`].
pub const MIN_PRECISION: u8 = 1;
/// Finest precision produced by [`precision_for_zoom`].
pub const MAX_ZOOM_PRECISION: u8 = 6;

/// Lower zoom bound for each precision, in ascending order.
const BREAKPOINTS: [(f64, u8); 6] = [
    (0.0, 1),
    (3.0, 2),
    (5.0, 3),
    (7.0, 4),
    (10.0, 5),
    (11.0, 6),
];

/// Geohash precision (cell size class) for a map zoom level.
///
/// Total: negative or NaN zooms resolve to the coarsest precision.
pub fn precision_for_zoom(zoom: f64) -> u8 {
    BREAKPOINTS
        .iter()
        .rev()
        .find(|(from, _)| zoom >= *from)
        .map(|(_, p)| *p)
        .unwrap_or(MIN_PRECISION)
}
