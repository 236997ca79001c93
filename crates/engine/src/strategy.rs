//! Strategy selection.
//!
//! Zoom thresholds decide what an event does before any request is made; the
//! cardinality probe decides between clusters and exact features at high zoom.

use foundation::bounds::BoundingBox;
use foundation::containment::contains_extent;
use serde::Serialize;

use crate::config::EngineConfig;

/// Which fetch path feeds the render model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    ClusterAggregate,
    ExactFeatureSearch,
}

/// What one event does, decided from zoom alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Below the minimum zoom: fetch nothing, show nothing.
    CountOnly,
    /// Below the full-data zoom: one low-precision aggregate, cache reset.
    FullRedraw,
    /// Cluster aggregate per tile, with delta fetch.
    TileAggregate,
    /// Probe first, then pick the strategy from the count.
    Probe,
}

pub fn plan_for_zoom(zoom: f64, config: &EngineConfig) -> Plan {
    if config.min_zoom.map(|min| zoom < min).unwrap_or(false) {
        Plan::CountOnly
    } else if zoom < config.full_data_zoom {
        Plan::FullRedraw
    } else if zoom < config.test_count_zoom {
        Plan::TileAggregate
    } else {
        Plan::Probe
    }
}

/// Exact search only when the estimate is strictly below the threshold.
pub fn strategy_for_count(estimated: u64, max_features_for_cluster: u64) -> Strategy {
    if estimated < max_features_for_cluster {
        Strategy::ExactFeatureSearch
    } else {
        Strategy::ClusterAggregate
    }
}

/// Outcome of a successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeDecision {
    /// Nothing matches the view; clear and fetch nothing.
    CountOnly,
    Fetch(Strategy),
}

pub fn decide_after_probe(estimated: u64, max_features_for_cluster: u64) -> ProbeDecision {
    if estimated == 0 {
        ProbeDecision::CountOnly
    } else {
        ProbeDecision::Fetch(strategy_for_count(estimated, max_features_for_cluster))
    }
}

/// How cluster tiles are refreshed for a new extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileMode {
    /// Keep the cache and fetch only tiles it does not know.
    Delta,
    /// Purge and fetch the whole view again.
    FullReload,
}

pub fn tile_mode(loaded: Option<&BoundingBox>, next: &BoundingBox, pinned: bool) -> TileMode {
    if pinned {
        return TileMode::FullReload;
    }
    match loaded {
        // Nothing loaded since the last purge: the delta is the whole target.
        None => TileMode::Delta,
        Some(prev) if contains_extent(prev, next) => TileMode::Delta,
        Some(_) => TileMode::FullReload,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Plan, ProbeDecision, Strategy, TileMode, decide_after_probe, plan_for_zoom,
        strategy_for_count, tile_mode,
    };
    use crate::config::EngineConfig;
    use foundation::bounds::BoundingBox;

    fn config() -> EngineConfig {
        let mut cfg = EngineConfig::new("map", "position", "id", "id");
        cfg.full_data_zoom = 7.0;
        cfg.test_count_zoom = 11.0;
        cfg
    }

    #[test]
    fn zoom_bands_pick_the_plan() {
        let mut cfg = config();
        assert_eq!(plan_for_zoom(2.0, &cfg), Plan::FullRedraw);
        assert_eq!(plan_for_zoom(7.0, &cfg), Plan::TileAggregate);
        assert_eq!(plan_for_zoom(10.9, &cfg), Plan::TileAggregate);
        assert_eq!(plan_for_zoom(11.0, &cfg), Plan::Probe);
        assert_eq!(plan_for_zoom(14.0, &cfg), Plan::Probe);

        cfg.min_zoom = Some(3.0);
        assert_eq!(plan_for_zoom(2.0, &cfg), Plan::CountOnly);
        assert_eq!(plan_for_zoom(3.0, &cfg), Plan::FullRedraw);
    }

    #[test]
    fn threshold_is_inclusive_on_the_cluster_side() {
        assert_eq!(strategy_for_count(1000, 1000), Strategy::ClusterAggregate);
        assert_eq!(strategy_for_count(999, 1000), Strategy::ExactFeatureSearch);
        assert_eq!(strategy_for_count(5, 1000), Strategy::ExactFeatureSearch);
        assert_eq!(strategy_for_count(50_000, 1000), Strategy::ClusterAggregate);
    }

    #[test]
    fn empty_probe_means_count_only() {
        assert_eq!(decide_after_probe(0, 1000), ProbeDecision::CountOnly);
        assert_eq!(
            decide_after_probe(1, 1000),
            ProbeDecision::Fetch(Strategy::ExactFeatureSearch)
        );
    }

    #[test]
    fn contained_extent_is_a_delta() {
        let prev = BoundingBox::new(10.0, 10.0, -10.0, -10.0);
        let inner = BoundingBox::new(5.0, 5.0, -5.0, -5.0);
        let outer = BoundingBox::new(20.0, 20.0, -20.0, -20.0);

        assert_eq!(tile_mode(Some(&prev), &inner, false), TileMode::Delta);
        assert_eq!(tile_mode(Some(&prev), &prev, false), TileMode::Delta);
        assert_eq!(tile_mode(Some(&prev), &outer, false), TileMode::FullReload);
        assert_eq!(tile_mode(None, &outer, false), TileMode::Delta);
        assert_eq!(tile_mode(Some(&prev), &inner, true), TileMode::FullReload);
    }
}
