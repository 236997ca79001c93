use std::collections::BTreeMap;

use serde::Serialize;

/// Engine counters. Ordered so snapshots have a stable layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Counter {
    ViewportEvents,
    FilterEvents,
    /// Our own selection-box filter coming back over the bus.
    OwnFilterEchoes,
    ProbeRequests,
    AggregateRequests,
    SearchRequests,
    StaleResponses,
    FailedResponses,
    DuplicateFeatures,
    CachePurges,
    SkippedFetches,
}

impl Counter {
    pub fn name(self) -> &'static str {
        match self {
            Counter::ViewportEvents => "viewport_events",
            Counter::FilterEvents => "filter_events",
            Counter::OwnFilterEchoes => "own_filter_echoes",
            Counter::ProbeRequests => "probe_requests",
            Counter::AggregateRequests => "aggregate_requests",
            Counter::SearchRequests => "search_requests",
            Counter::StaleResponses => "stale_responses",
            Counter::FailedResponses => "failed_responses",
            Counter::DuplicateFeatures => "duplicate_features",
            Counter::CachePurges => "cache_purges",
            Counter::SkippedFetches => "skipped_fetches",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Gauge {
    RenderedFeatures,
    KnownTiles,
    InflightRequests,
}

impl Gauge {
    pub fn name(self) -> &'static str {
        match self {
            Gauge::RenderedFeatures => "rendered_features",
            Gauge::KnownTiles => "known_tiles",
            Gauge::InflightRequests => "inflight_requests",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Histogram {
    pub count: u64,
    pub sum: i64,
    pub min: i64,
    pub max: i64,
}

impl Histogram {
    pub fn record(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

/// Deterministic engine metrics, owned by the engine task.
///
/// `features_per_tile` records how many features each merged tile response
/// contributed after deduplication.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metrics {
    counters: BTreeMap<Counter, u64>,
    gauges: BTreeMap<Gauge, i64>,
    features_per_tile: Histogram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<(&'static str, u64)>,
    pub gauges: Vec<(&'static str, i64)>,
    pub features_per_tile: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, c: Counter) -> u64 {
        self.counters.get(&c).copied().unwrap_or(0)
    }

    pub fn inc(&mut self, c: Counter) {
        self.add(c, 1);
    }

    pub fn add(&mut self, c: Counter, by: u64) {
        *self.counters.entry(c).or_insert(0) += by;
    }

    pub fn gauge(&self, g: Gauge) -> Option<i64> {
        self.gauges.get(&g).copied()
    }

    pub fn set_gauge(&mut self, g: Gauge, value: i64) {
        self.gauges.insert(g, value);
    }

    pub fn record_tile_features(&mut self, accepted: usize) {
        self.features_per_tile
            .record(i64::try_from(accepted).unwrap_or(i64::MAX));
    }

    pub fn features_per_tile(&self) -> Histogram {
        self.features_per_tile
    }

    /// Total backend round-trips issued so far.
    pub fn backend_calls(&self) -> u64 {
        self.counter(Counter::ProbeRequests)
            + self.counter(Counter::AggregateRequests)
            + self.counter(Counter::SearchRequests)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.iter().map(|(k, v)| (k.name(), *v)).collect(),
            gauges: self.gauges.iter().map(|(k, v)| (k.name(), *v)).collect(),
            features_per_tile: self.features_per_tile,
        }
    }
}
