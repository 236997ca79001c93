//! Synchronous engine core.
//!
//! `EngineState` owns everything one visual knows. Events and backend
//! completions go in, a [`Transition`] comes out listing the requests to
//! issue, the errors to report and whether the render model changed. Nothing
//! here awaits; the driver performs the requests and feeds completions back.

use std::fmt;

use foundation::bounds::BoundingBox;
use foundation::geohash;
use foundation::tile::TileKey;
use runtime::filter_bus::{FilterExpression, WidgetId};
use runtime::generation::Generation;
use runtime::metrics::{Counter, Gauge, Metrics};
use serde::Serialize;
use streaming::backend::BackendError;
use streaming::cache::TileFeatureCache;
use streaming::protocol::{AggregateRequest, AggregateResponse, SearchRequest, SearchResponse};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError};
use crate::merge::{aggregate_request, merge_aggregation, merge_exact, search_request};
use crate::probe::{estimated_count, probe_request};
use crate::render::RenderModel;
use crate::strategy::{
    Plan, ProbeDecision, Strategy, TileMode, decide_after_probe, plan_for_zoom, tile_mode,
};
use crate::viewport::{PinChange, Viewport, ViewportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Probing,
    Fetching,
}

/// What an aggregate request covers.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchScope {
    /// One tile; the result is appended.
    Tile(TileKey),
    /// A whole extent (`None` is the world); the result replaces the render model.
    Extent(Option<BoundingBox>),
}

impl fmt::Display for FetchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tile(tile) => write!(f, "tile {tile}"),
            Self::Extent(None) => write!(f, "world"),
            Self::Extent(Some(b)) => write!(
                f,
                "extent [{}, {}, {}, {}]",
                b.north, b.west, b.south, b.east
            ),
        }
    }
}

/// Clock a request is checked against when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// Valid until the next event: probes and extent-wide aggregates.
    View(Generation),
    /// Valid until the tile cache is purged: per-tile fetches.
    Cache(Generation),
}

/// A backend call to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Probe {
        stamp: Stamp,
        request: AggregateRequest,
    },
    Aggregate {
        stamp: Stamp,
        scope: FetchScope,
        request: AggregateRequest,
    },
    Search {
        stamp: Stamp,
        tile: TileKey,
        request: SearchRequest,
    },
}

impl Command {
    pub fn stamp(&self) -> Stamp {
        match self {
            Self::Probe { stamp, .. }
            | Self::Aggregate { stamp, .. }
            | Self::Search { stamp, .. } => *stamp,
        }
    }
}

/// Result of a [`Command`], carrying the same stamp.
#[derive(Debug)]
pub enum Completion {
    Probe {
        stamp: Stamp,
        result: Result<AggregateResponse, BackendError>,
    },
    Aggregate {
        stamp: Stamp,
        scope: FetchScope,
        result: Result<AggregateResponse, BackendError>,
    },
    Search {
        stamp: Stamp,
        tile: TileKey,
        result: Result<SearchResponse, BackendError>,
    },
}

impl Completion {
    pub fn stamp(&self) -> Stamp {
        match self {
            Self::Probe { stamp, .. }
            | Self::Aggregate { stamp, .. }
            | Self::Search { stamp, .. } => *stamp,
        }
    }
}

#[derive(Debug, Default)]
pub struct Transition {
    pub commands: Vec<Command>,
    pub errors: Vec<EngineError>,
    /// The render model changed.
    pub redraw: bool,
    /// The selection box changed and the bus filter must follow.
    pub pin: Option<PinChange>,
}

/// Observable summary of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EngineStatus {
    pub phase: Phase,
    pub strategy: Strategy,
    pub generation: u64,
    pub precision: u8,
    pub rendered: usize,
}

#[derive(Debug)]
pub struct EngineState {
    config: EngineConfig,
    widget: WidgetId,
    viewport: ViewportState,
    strategy: Strategy,
    generation: Generation,
    cache: TileFeatureCache,
    render: RenderModel,
    /// Extent the resident cluster tiles were loaded for, since the last purge.
    loaded_extent: Option<BoundingBox>,
    /// Geohash length of derived tiles, fixed between purges.
    tile_level: Option<u8>,
    inflight: usize,
    probing: bool,
    peer_filters: Vec<FilterExpression>,
    metrics: Metrics,
}

impl EngineState {
    pub fn new(config: EngineConfig, initial_zoom: f64) -> Result<Self, ConfigError> {
        config.validate()?;
        let widget = WidgetId::new(config.widget_id.clone());
        Ok(Self {
            config,
            widget,
            viewport: ViewportState::new(initial_zoom),
            strategy: Strategy::default(),
            generation: Generation::default(),
            cache: TileFeatureCache::new(),
            render: RenderModel::new(),
            loaded_extent: None,
            tile_level: None,
            inflight: 0,
            probing: false,
            peer_filters: Vec::new(),
            metrics: Metrics::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn widget(&self) -> &WidgetId {
        &self.widget
    }

    pub fn viewport(&self) -> &ViewportState {
        &self.viewport
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn precision(&self) -> u8 {
        self.viewport.precision()
    }

    pub fn cache(&self) -> &TileFeatureCache {
        &self.cache
    }

    pub fn render(&self) -> &RenderModel {
        &self.render
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }

    pub fn phase(&self) -> Phase {
        if self.probing {
            Phase::Probing
        } else if self.inflight > 0 {
            Phase::Fetching
        } else {
            Phase::Idle
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            phase: self.phase(),
            strategy: self.strategy,
            generation: self.generation.0,
            precision: self.precision(),
            rendered: self.render.len(),
        }
    }

    /// Replace the peer filters without triggering a recompute.
    pub fn set_peer_filters(&mut self, filters: Vec<FilterExpression>) {
        self.peer_filters = filters;
    }

    pub fn on_viewport_changed(&mut self, vp: &Viewport) -> Transition {
        self.metrics.inc(Counter::ViewportEvents);
        self.begin_generation();

        let update = self.viewport.apply(vp);
        let mut t = Transition {
            pin: update.pin,
            ..Transition::default()
        };
        debug!(
            generation = self.generation.0,
            zoom = vp.zoom,
            precision = self.precision(),
            "viewport changed"
        );

        if update.precision_changed || update.pin.is_some() {
            info!(
                precision = self.precision(),
                pinned = update.pin.is_some(),
                "partition changed, resetting"
            );
            self.purge();
            self.clear_render(&mut t);
        }
        self.evaluate(&mut t);
        self.finish(t)
    }

    pub fn on_selection_box_removed(&mut self) -> Transition {
        let Some(change) = self.viewport.clear_pin() else {
            debug!("selection removal without a pinned extent");
            return Transition::default();
        };
        self.begin_generation();
        info!(generation = self.generation.0, "selection box removed");

        let mut t = Transition {
            pin: Some(change),
            ..Transition::default()
        };
        self.purge();
        self.clear_render(&mut t);
        self.evaluate(&mut t);
        self.finish(t)
    }

    /// Another widget changed the shared filters: recompute from scratch.
    pub fn on_peer_filter_changed(&mut self, filters: Vec<FilterExpression>) -> Transition {
        self.metrics.inc(Counter::FilterEvents);
        self.begin_generation();
        self.peer_filters = filters;
        info!(
            generation = self.generation.0,
            filters = self.peer_filters.len(),
            "peer filters changed"
        );

        let mut t = Transition::default();
        self.purge();
        self.clear_render(&mut t);
        self.evaluate(&mut t);
        self.finish(t)
    }

    /// Our own filter came back over the bus. Counted, never recomputed.
    pub fn on_own_filter_echo(&mut self) {
        self.metrics.inc(Counter::OwnFilterEchoes);
    }

    pub fn on_completion(&mut self, completion: Completion) -> Transition {
        self.inflight = self.inflight.saturating_sub(1);
        let mut t = Transition::default();

        let stamp = completion.stamp();
        if !self.is_current(stamp) {
            self.metrics.inc(Counter::StaleResponses);
            debug!(
                ?stamp,
                generation = self.generation.0,
                epoch = self.cache.epoch().0,
                "discarding stale response"
            );
            return self.finish(t);
        }

        match completion {
            Completion::Probe { result, .. } => {
                self.probing = false;
                match result {
                    Ok(response) => self.apply_probe(&response, &mut t),
                    Err(err) => {
                        self.metrics.inc(Counter::FailedResponses);
                        t.errors.push(EngineError::Probe(err));
                    }
                }
            }
            Completion::Aggregate { scope, result, .. } => match result {
                Ok(response) => {
                    let features = merge_aggregation(&self.config, &response, &mut self.cache);
                    debug!(%scope, features = features.len(), "aggregate merged");
                    match scope {
                        FetchScope::Tile(tile) => {
                            self.cache.mark_resident(&tile);
                            self.metrics.record_tile_features(features.len());
                            self.render.extend(features);
                        }
                        FetchScope::Extent(_) => self.render.replace(features),
                    }
                    t.redraw = true;
                }
                Err(err) => {
                    if let FetchScope::Tile(tile) = &scope {
                        self.cache.mark_failed(tile);
                    }
                    self.metrics.inc(Counter::FailedResponses);
                    t.errors.push(EngineError::Fetch {
                        scope: scope.to_string(),
                        source: err,
                    });
                }
            },
            Completion::Search { tile, result, .. } => match result {
                Ok(response) => {
                    let merged = merge_exact(&self.config, &tile, response, &mut self.cache);
                    self.cache.mark_resident(&tile);
                    self.metrics
                        .add(Counter::DuplicateFeatures, merged.duplicates as u64);
                    self.metrics.record_tile_features(merged.accepted.len());
                    if merged.missing_id > 0 {
                        warn!(%tile, dropped = merged.missing_id, "features without identifier");
                    }
                    debug!(
                        %tile,
                        accepted = merged.accepted.len(),
                        duplicates = merged.duplicates,
                        "search merged"
                    );
                    if !merged.accepted.is_empty() {
                        self.render.extend(merged.accepted);
                        t.redraw = true;
                    }
                }
                Err(err) => {
                    self.cache.mark_failed(&tile);
                    self.metrics.inc(Counter::FailedResponses);
                    t.errors.push(EngineError::Fetch {
                        scope: FetchScope::Tile(tile).to_string(),
                        source: err,
                    });
                }
            },
        }
        self.finish(t)
    }

    fn is_current(&self, stamp: Stamp) -> bool {
        match stamp {
            Stamp::View(generation) => !generation.is_stale(self.generation),
            Stamp::Cache(epoch) => !epoch.is_stale(self.cache.epoch()),
        }
    }

    fn begin_generation(&mut self) {
        self.generation = self.generation.next();
        // An outstanding probe now belongs to an older generation.
        self.probing = false;
    }

    fn evaluate(&mut self, t: &mut Transition) {
        let Some(extent) = self.viewport.extent() else {
            return;
        };

        match plan_for_zoom(self.viewport.zoom(), &self.config) {
            Plan::CountOnly => {
                debug!(zoom = self.viewport.zoom(), "below minimum zoom, nothing to fetch");
                self.purge();
                self.clear_render(t);
            }
            Plan::FullRedraw => {
                self.set_strategy(Strategy::ClusterAggregate, t);
                self.purge();
                let scope = FetchScope::Extent(self.viewport.pinned());
                self.push_aggregate(t, scope);
            }
            Plan::TileAggregate => {
                self.set_strategy(Strategy::ClusterAggregate, t);
                self.fetch_tiles(t, extent);
            }
            Plan::Probe => {
                let request = probe_request(
                    &self.config,
                    self.viewport.query_extent(),
                    self.peer_filters.clone(),
                );
                self.metrics.inc(Counter::ProbeRequests);
                self.inflight += 1;
                self.probing = true;
                t.commands.push(Command::Probe {
                    stamp: Stamp::View(self.generation),
                    request,
                });
            }
        }
    }

    fn apply_probe(&mut self, response: &AggregateResponse, t: &mut Transition) {
        let estimated = estimated_count(&self.config, response);
        let decision = decide_after_probe(estimated, self.config.max_features_for_cluster);
        info!(estimated, ?decision, "cardinality probe answered");

        match decision {
            ProbeDecision::CountOnly => {
                self.purge();
                self.clear_render(t);
            }
            ProbeDecision::Fetch(strategy) => {
                self.set_strategy(strategy, t);
                if let Some(extent) = self.viewport.extent() {
                    self.fetch_tiles(t, extent);
                }
            }
        }
    }

    fn fetch_tiles(&mut self, t: &mut Transition, extent: BoundingBox) {
        let pinned = self.viewport.pinned();

        if self.strategy == Strategy::ClusterAggregate {
            match tile_mode(self.loaded_extent.as_ref(), &extent, pinned.is_some()) {
                TileMode::FullReload if pinned.is_some() => {
                    self.purge();
                    self.push_aggregate(t, FetchScope::Extent(pinned));
                    return;
                }
                TileMode::FullReload => {
                    debug!("extent left the loaded area, reloading");
                    self.purge();
                    self.clear_render(t);
                }
                TileMode::Delta => {}
            }
        }

        let target = match self.viewport.reported_tiles() {
            Some(tiles) => tiles.clone(),
            None => {
                let level = self.derive_tile_level(t);
                self.viewport.derived_tiles(level)
            }
        };
        if self.strategy == Strategy::ClusterAggregate && self.loaded_extent.is_none() {
            self.loaded_extent = Some(extent);
        }

        let delta = self.cache.delta(&target);
        if delta.is_empty() {
            self.metrics.inc(Counter::SkippedFetches);
            debug!(tiles = target.len(), "every tile resident or in flight, no fetch");
            return;
        }
        debug!(
            tiles = target.len(),
            missing = delta.len(),
            strategy = ?self.strategy,
            "fetching tile delta"
        );

        let stamp = Stamp::Cache(self.cache.epoch());
        for tile in delta {
            let Some(bounds) = tile.bounds() else {
                warn!(%tile, "skipping tile without valid bounds");
                continue;
            };
            let bounds = match pinned {
                Some(pin) => match bounds.intersection(&pin) {
                    Some(b) => b,
                    None => continue,
                },
                None => bounds,
            };

            self.cache.mark_requested(tile.clone());
            self.inflight += 1;
            let command = match self.strategy {
                Strategy::ClusterAggregate => {
                    self.metrics.inc(Counter::AggregateRequests);
                    Command::Aggregate {
                        stamp,
                        scope: FetchScope::Tile(tile),
                        request: aggregate_request(
                            &self.config,
                            Some(bounds),
                            self.precision(),
                            self.peer_filters.clone(),
                        ),
                    }
                }
                Strategy::ExactFeatureSearch => {
                    self.metrics.inc(Counter::SearchRequests);
                    Command::Search {
                        stamp,
                        tile,
                        request: search_request(&self.config, bounds, self.peer_filters.clone()),
                    }
                }
            };
            t.commands.push(command);
        }
    }

    /// Geohash length for tiles derived from the query extent.
    ///
    /// The finest length up to the precision whose cover stays within
    /// `max_tiles_per_view`. Kept until the next purge so resident tiles never
    /// overlap; a view that outgrows it is reloaded at a coarser length.
    fn derive_tile_level(&mut self, t: &mut Transition) -> u8 {
        let Some(extent) = self.viewport.query_extent() else {
            return self.precision();
        };
        let max = self.config.max_tiles_per_view as u64;
        if let Some(level) = self.tile_level {
            if geohash::cover_len(&extent, level) <= max {
                return level;
            }
            info!(level, max, "view needs too many tiles, reloading coarser");
            self.purge();
            self.clear_render(t);
        }
        let level = geohash::fitting_precision(&extent, self.precision(), max);
        debug!(level, precision = self.precision(), "tile level chosen");
        self.tile_level = Some(level);
        level
    }

    fn push_aggregate(&mut self, t: &mut Transition, scope: FetchScope) {
        let extent = match &scope {
            FetchScope::Tile(tile) => tile.bounds(),
            FetchScope::Extent(extent) => *extent,
        };
        self.metrics.inc(Counter::AggregateRequests);
        self.inflight += 1;
        t.commands.push(Command::Aggregate {
            stamp: Stamp::View(self.generation),
            request: aggregate_request(
                &self.config,
                extent,
                self.precision(),
                self.peer_filters.clone(),
            ),
            scope,
        });
    }

    fn set_strategy(&mut self, strategy: Strategy, t: &mut Transition) {
        if strategy == self.strategy {
            return;
        }
        info!(from = ?self.strategy, to = ?strategy, "strategy changed");
        self.strategy = strategy;
        self.purge();
        self.clear_render(t);
    }

    fn purge(&mut self) {
        self.cache.purge();
        self.loaded_extent = None;
        self.tile_level = None;
        self.metrics.inc(Counter::CachePurges);
    }

    fn clear_render(&mut self, t: &mut Transition) {
        if !self.render.is_empty() {
            self.render.clear();
            t.redraw = true;
        }
    }

    fn finish(&mut self, t: Transition) -> Transition {
        let gauge = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        self.metrics
            .set_gauge(Gauge::RenderedFeatures, gauge(self.render.len()));
        self.metrics.set_gauge(Gauge::KnownTiles, gauge(self.cache.len()));
        self.metrics
            .set_gauge(Gauge::InflightRequests, gauge(self.inflight));
        t
    }
}
