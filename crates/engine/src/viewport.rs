use std::collections::BTreeSet;

use foundation::bounds::BoundingBox;
use foundation::geohash;
use foundation::precision::precision_for_zoom;
use foundation::tile::TileKey;

/// One viewport event as reported by the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub zoom: f64,
    pub extent: BoundingBox,
    /// Tiles the map reports as covering `extent`. Empty means "derive them".
    pub tiles: BTreeSet<TileKey>,
    /// The user has drawn a selection box and `extent` is that box.
    pub pinned_extent: bool,
}

impl Viewport {
    pub fn new(zoom: f64, extent: BoundingBox) -> Self {
        Self {
            zoom,
            extent,
            tiles: BTreeSet::new(),
            pinned_extent: false,
        }
    }

    pub fn with_tiles(mut self, tiles: impl IntoIterator<Item = TileKey>) -> Self {
        self.tiles = tiles.into_iter().collect();
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned_extent = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinChange {
    Pinned(BoundingBox),
    Released,
}

/// What changed when a viewport event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportUpdate {
    pub precision_changed: bool,
    pub pin: Option<PinChange>,
}

/// Current view of one visual: zoom, precision, extent, covering tiles and pin.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportState {
    zoom: f64,
    precision: u8,
    extent: Option<BoundingBox>,
    tiles: BTreeSet<TileKey>,
    pinned: Option<BoundingBox>,
}

impl ViewportState {
    pub fn new(zoom: f64) -> Self {
        Self {
            zoom,
            precision: precision_for_zoom(zoom),
            extent: None,
            tiles: BTreeSet::new(),
            pinned: None,
        }
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn extent(&self) -> Option<BoundingBox> {
        self.extent
    }

    pub fn pinned(&self) -> Option<BoundingBox> {
        self.pinned
    }

    /// Fold a viewport event into the state.
    ///
    /// The first pinned event fixes the pin; later events keep it until
    /// [`ViewportState::clear_pin`], whatever extent they carry.
    pub fn apply(&mut self, vp: &Viewport) -> ViewportUpdate {
        let precision = precision_for_zoom(vp.zoom);
        let mut update = ViewportUpdate {
            precision_changed: precision != self.precision,
            pin: None,
        };

        self.zoom = vp.zoom;
        self.precision = precision;
        self.extent = Some(vp.extent.clamped());
        self.tiles = vp.tiles.clone();

        if vp.pinned_extent && self.pinned.is_none() {
            let pin = vp.extent.clamped();
            self.pinned = Some(pin);
            update.pin = Some(PinChange::Pinned(pin));
        }
        update
    }

    /// Drop the pin. Returns `None` when nothing was pinned.
    pub fn clear_pin(&mut self) -> Option<PinChange> {
        self.pinned.take().map(|_| PinChange::Released)
    }

    /// Extent every query is scoped to: the pin if any, else the view.
    pub fn query_extent(&self) -> Option<BoundingBox> {
        self.pinned.or(self.extent)
    }

    /// Tiles reported by the map, when they apply: no pin is set and the
    /// map reported any.
    pub fn reported_tiles(&self) -> Option<&BTreeSet<TileKey>> {
        if self.pinned.is_some() || self.tiles.is_empty() {
            return None;
        }
        Some(&self.tiles)
    }

    /// Geohash tiles of length `level` covering the query extent.
    pub fn derived_tiles(&self, level: u8) -> BTreeSet<TileKey> {
        self.query_extent()
            .map(|e| cover(&e, level))
            .unwrap_or_default()
    }
}

fn cover(extent: &BoundingBox, precision: u8) -> BTreeSet<TileKey> {
    geohash::cover(extent, precision)
        .into_iter()
        .map(TileKey::Geohash)
        .collect()
}
