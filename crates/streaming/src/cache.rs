use std::collections::{BTreeMap, BTreeSet};

use foundation::tile::TileKey;
use runtime::generation::Generation;

/// Where a tile stands in the cache. Failed tiles are removed rather than
/// marked, so they count as unknown again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResidencyState {
    Requested,
    Resident,
}

#[derive(Debug, Clone)]
struct TileEntry {
    state: ResidencyState,
    features: BTreeSet<String>,
}

/// Keyed store of fetched tiles and the feature ids each one contributed.
///
/// Invariants:
/// - A feature id is accepted at most once across all tiles.
/// - Resident tiles only grow until [`TileFeatureCache::purge`].
/// - A tile that failed to load is forgotten, so it reappears in the next delta.
/// - Tile responses stay valid until the next purge, which advances [`TileFeatureCache::epoch`].
///
/// Entries are keyed in a `BTreeMap` so delta computation and iteration are deterministic.
#[derive(Debug, Default)]
pub struct TileFeatureCache {
    tiles: BTreeMap<TileKey, TileEntry>,
    feature_ids: BTreeSet<String>,
    max_count: u64,
    purges: u64,
}

impl TileFeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Number of purges since creation.
    pub fn purges(&self) -> u64 {
        self.purges
    }

    /// Stamp for tile requests issued now. A response carrying an older
    /// epoch was requested before a purge and must not be merged.
    pub fn epoch(&self) -> Generation {
        Generation(self.purges)
    }

    pub fn state(&self, tile: &TileKey) -> Option<ResidencyState> {
        self.tiles.get(tile).map(|e| e.state)
    }

    pub fn is_resident(&self, tile: &TileKey) -> bool {
        self.tiles
            .get(tile)
            .map(|e| e.state == ResidencyState::Resident)
            .unwrap_or(false)
    }

    pub fn resident_tiles(&self) -> impl Iterator<Item = &TileKey> {
        self.tiles
            .iter()
            .filter(|(_, e)| e.state == ResidencyState::Resident)
            .map(|(k, _)| k)
    }

    pub fn resident_count(&self) -> usize {
        self.resident_tiles().count()
    }

    /// Tiles of `target` that are neither resident nor in flight.
    pub fn delta(&self, target: &BTreeSet<TileKey>) -> Vec<TileKey> {
        target
            .iter()
            .filter(|tile| !self.tiles.contains_key(*tile))
            .cloned()
            .collect()
    }

    pub fn mark_requested(&mut self, tile: TileKey) {
        self.tiles.entry(tile).or_insert_with(|| TileEntry {
            state: ResidencyState::Requested,
            features: BTreeSet::new(),
        });
    }

    pub fn mark_resident(&mut self, tile: &TileKey) {
        if let Some(e) = self.tiles.get_mut(tile) {
            e.state = ResidencyState::Resident;
        } else {
            self.tiles.insert(
                tile.clone(),
                TileEntry {
                    state: ResidencyState::Resident,
                    features: BTreeSet::new(),
                },
            );
        }
    }

    /// Forget a tile whose fetch failed. Resident tiles are left untouched.
    pub fn mark_failed(&mut self, tile: &TileKey) {
        if self
            .tiles
            .get(tile)
            .map(|e| e.state != ResidencyState::Resident)
            .unwrap_or(false)
        {
            self.tiles.remove(tile);
        }
    }

    pub fn contains_feature(&self, id: &str) -> bool {
        self.feature_ids.contains(id)
    }

    pub fn feature_count(&self) -> usize {
        self.feature_ids.len()
    }

    /// Record `id` as contributed by `tile`. Returns `false` if any tile already contributed it.
    pub fn insert_feature(&mut self, tile: &TileKey, id: &str) -> bool {
        if !self.feature_ids.insert(id.to_string()) {
            return false;
        }
        if let Some(e) = self.tiles.get_mut(tile) {
            e.features.insert(id.to_string());
        }
        true
    }

    pub fn tile_features(&self, tile: &TileKey) -> Option<&BTreeSet<String>> {
        self.tiles.get(tile).map(|e| &e.features)
    }

    /// Fold `count` into the running maximum and return the new maximum.
    pub fn observe_count(&mut self, count: u64) -> u64 {
        self.max_count = self.max_count.max(count);
        self.max_count
    }

    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    /// Drop every tile, feature id and the running maximum.
    pub fn purge(&mut self) {
        self.tiles.clear();
        self.feature_ids.clear();
        self.max_count = 0;
        self.purges += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{ResidencyState, TileFeatureCache};
    use foundation::tile::TileKey;
    use runtime::generation::Generation;

    fn tiles(keys: &[&str]) -> BTreeSet<TileKey> {
        keys.iter().map(|k| TileKey::geohash(*k)).collect()
    }

    #[test]
    fn delta_skips_resident_and_inflight_tiles() {
        let mut cache = TileFeatureCache::new();
        let target = tiles(&["u09", "u0b", "u0c"]);

        assert_eq!(cache.delta(&target).len(), 3);

        cache.mark_requested(TileKey::geohash("u09"));
        cache.mark_resident(&TileKey::geohash("u09"));
        cache.mark_requested(TileKey::geohash("u0b"));

        assert_eq!(cache.delta(&target), vec![TileKey::geohash("u0c")]);
        // Asking again while u0b is still in flight does not re-request it.
        assert_eq!(cache.delta(&target), vec![TileKey::geohash("u0c")]);
    }

    #[test]
    fn purge_advances_the_epoch() {
        let mut cache = TileFeatureCache::new();
        let before = cache.epoch();
        cache.mark_requested(TileKey::geohash("u09"));
        assert_eq!(cache.epoch(), before);

        cache.purge();
        assert_eq!(cache.epoch(), Generation(1));
        assert!(before.is_stale(cache.epoch()));
        assert_eq!(cache.delta(&tiles(&["u09"])).len(), 1);
    }

    #[test]
    fn delta_is_empty_once_everything_is_resident() {
        let mut cache = TileFeatureCache::new();
        let target = tiles(&["a1", "a2"]);
        for t in &target {
            cache.mark_requested(t.clone());
            cache.mark_resident(t);
        }
        assert!(cache.delta(&target).is_empty());
        assert_eq!(cache.resident_count(), 2);
    }

    #[test]
    fn failed_tile_is_forgotten() {
        let mut cache = TileFeatureCache::new();
        let t = TileKey::geohash("u09");
        cache.mark_requested(t.clone());
        cache.mark_failed(&t);
        assert_eq!(cache.state(&t), None);

        cache.mark_requested(t.clone());
        cache.mark_resident(&t);
        cache.mark_failed(&t);
        assert_eq!(cache.state(&t), Some(ResidencyState::Resident));
    }

    #[test]
    fn feature_ids_are_unique_across_tiles() {
        let mut cache = TileFeatureCache::new();
        let a = TileKey::geohash("u09");
        let b = TileKey::geohash("u0b");
        cache.mark_requested(a.clone());
        cache.mark_requested(b.clone());

        assert!(cache.insert_feature(&a, "X1"));
        assert!(!cache.insert_feature(&b, "X1"));
        assert_eq!(cache.feature_count(), 1);
        assert!(cache.tile_features(&b).map(BTreeSet::is_empty).unwrap_or(false));
    }

    #[test]
    fn purge_clears_everything() {
        let mut cache = TileFeatureCache::new();
        let a = TileKey::geohash("u09");
        cache.mark_requested(a.clone());
        cache.mark_resident(&a);
        cache.insert_feature(&a, "X1");
        assert_eq!(cache.observe_count(12), 12);
        assert_eq!(cache.observe_count(3), 12);

        cache.purge();
        assert!(cache.is_empty());
        assert!(!cache.contains_feature("X1"));
        assert_eq!(cache.max_count(), 0);
        assert_eq!(cache.purges(), 1);
    }
}
