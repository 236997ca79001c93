//! Async driver.
//!
//! One tokio task owns the [`EngineState`]. UI events arrive as messages,
//! peer filter changes arrive from the bus subscription, and backend calls run
//! as futures in a `FuturesUnordered` polled by the same task, so every
//! completion is applied on the owner, one at a time, in arrival order.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use runtime::filter_bus::{FilterBus, FilterExpression, FilterSubscription, TaggedFilterEvent};
use runtime::metrics::MetricsSnapshot;
use streaming::backend::{BoxFuture, SearchBackend};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, ErrorChannel};
use crate::render::RenderModel;
use crate::state::{Command, Completion, EngineState, EngineStatus, Transition};
use crate::viewport::{PinChange, Viewport};

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug)]
enum Request {
    Viewport(Viewport),
    SelectionRemoved,
    /// Answered once nothing is in flight.
    Settle(oneshot::Sender<()>),
    Metrics(oneshot::Sender<MetricsSnapshot>),
}

/// Cloneable handle to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Request>,
    render: watch::Receiver<Arc<RenderModel>>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    pub async fn viewport_changed(&self, viewport: Viewport) -> Result<(), EngineError> {
        self.send(Request::Viewport(viewport)).await
    }

    pub async fn selection_box_removed(&self) -> Result<(), EngineError> {
        self.send(Request::SelectionRemoved).await
    }

    /// Wait until every issued request has completed.
    pub async fn settled(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Settle(tx)).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Metrics(tx)).await?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Current render model. Read-only snapshot.
    pub fn render_model(&self) -> Arc<RenderModel> {
        self.render.borrow().clone()
    }

    /// Redraw notifications: changes whenever the render model does.
    pub fn on_redraw(&self) -> watch::Receiver<Arc<RenderModel>> {
        self.render.clone()
    }

    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    async fn send(&self, req: Request) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::Closed)
    }
}

type Inflight = FuturesUnordered<BoxFuture<'static, Completion>>;

/// Start an engine task for one visual.
///
/// Fails only on configuration errors. The task stops when every handle is
/// dropped.
pub fn spawn(
    config: EngineConfig,
    initial_zoom: f64,
    backend: Arc<dyn SearchBackend>,
    bus: Arc<dyn FilterBus>,
    errors: ErrorChannel,
) -> Result<EngineHandle, ConfigError> {
    let mut state = EngineState::new(config, initial_zoom)?;
    state.set_peer_filters(bus.peer_filters(state.widget()));

    let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
    let (render_tx, render_rx) = watch::channel(Arc::new(state.render().clone()));
    let (status_tx, status_rx) = watch::channel(state.status());
    let subscription = bus.subscribe(state.widget());

    let actor = Actor {
        state,
        backend,
        bus,
        errors,
        inflight: FuturesUnordered::new(),
        settle_waiters: Vec::new(),
        render_tx,
        status_tx,
    };
    tokio::spawn(actor.run(rx, subscription));

    Ok(EngineHandle {
        tx,
        render: render_rx,
        status: status_rx,
    })
}

struct Actor {
    state: EngineState,
    backend: Arc<dyn SearchBackend>,
    bus: Arc<dyn FilterBus>,
    errors: ErrorChannel,
    inflight: Inflight,
    settle_waiters: Vec<oneshot::Sender<()>>,
    render_tx: watch::Sender<Arc<RenderModel>>,
    status_tx: watch::Sender<EngineStatus>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>, mut subscription: FilterSubscription) {
        let mut bus_open = true;
        info!(widget = %self.state.widget(), "engine started");

        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
                event = subscription.recv(), if bus_open => match event {
                    Some(event) => self.handle_bus_event(event),
                    None => {
                        debug!("filter bus closed");
                        bus_open = false;
                    }
                },
                Some(completion) = self.inflight.next(), if !self.inflight.is_empty() => {
                    let t = self.state.on_completion(completion);
                    self.apply(t);
                }
            }
            self.release_waiters();
        }
        info!(widget = %self.state.widget(), "engine stopped");
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Viewport(vp) => {
                let t = self.state.on_viewport_changed(&vp);
                self.apply(t);
            }
            Request::SelectionRemoved => {
                let t = self.state.on_selection_box_removed();
                self.apply(t);
            }
            Request::Settle(waiter) => self.settle_waiters.push(waiter),
            Request::Metrics(reply) => {
                let _ = reply.send(self.state.metrics().snapshot());
            }
        }
    }

    fn handle_bus_event(&mut self, event: TaggedFilterEvent) {
        if !event.is_peer() {
            self.state.on_own_filter_echo();
            return;
        }
        debug!(origin = ?event.origin, change = ?event.change, "peer filter event");
        let filters = self.bus.peer_filters(self.state.widget());
        let t = self.state.on_peer_filter_changed(filters);
        self.apply(t);
    }

    fn apply(&mut self, t: Transition) {
        match t.pin {
            Some(PinChange::Pinned(extent)) => self
                .bus
                .publish_filter(self.state.widget(), FilterExpression::Extent { extent }),
            Some(PinChange::Released) => self.bus.remove_filter(self.state.widget()),
            None => {}
        }

        for err in t.errors {
            self.errors.report(err);
        }

        for command in t.commands {
            self.inflight.push(execute(self.backend.clone(), command));
        }

        if t.redraw {
            self.render_tx
                .send_replace(Arc::new(self.state.render().clone()));
        }
        self.status_tx.send_replace(self.state.status());
    }

    fn release_waiters(&mut self) {
        if self.inflight.is_empty() && !self.settle_waiters.is_empty() {
            for waiter in self.settle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

/// Perform one backend call. The completion keeps the command's stamp.
fn execute(backend: Arc<dyn SearchBackend>, command: Command) -> BoxFuture<'static, Completion> {
    Box::pin(async move {
        match command {
            Command::Probe { stamp, request } => Completion::Probe {
                stamp,
                result: backend.aggregate(request).await,
            },
            Command::Aggregate {
                stamp,
                scope,
                request,
            } => Completion::Aggregate {
                stamp,
                scope,
                result: backend.aggregate(request).await,
            },
            Command::Search {
                stamp,
                tile,
                request,
            } => Completion::Search {
                stamp,
                tile,
                result: backend.search(request).await,
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::spawn;
    use crate::config::EngineConfig;
    use crate::error::{EngineError, ErrorChannel};
    use crate::state::Phase;
    use crate::strategy::Strategy;
    use crate::viewport::Viewport;
    use foundation::bounds::{BoundingBox, LonLat};
    use pretty_assertions::assert_eq;
    use runtime::filter_bus::{FilterBus, FilterExpression, SharedFilterBus, WidgetId};
    use runtime::metrics::MetricsSnapshot;
    use serde_json::json;
    use streaming::backend::{BackendError, BoxFuture, SearchBackend};
    use streaming::memory::{MemoryBackend, MemoryRecord};
    use streaming::protocol::{AggregateRequest, AggregateResponse, SearchRequest, SearchResponse};

    fn records() -> Vec<MemoryRecord> {
        vec![
            MemoryRecord::new("a", LonLat::new(2.35, 48.85))
                .with_field("mmsi", "a")
                .with_field("kind", "cargo"),
            MemoryRecord::new("b", LonLat::new(2.36, 48.86))
                .with_field("mmsi", "b")
                .with_field("kind", "tanker"),
            MemoryRecord::new("c", LonLat::new(2.37, 48.86))
                .with_field("mmsi", "c")
                .with_field("kind", "cargo"),
        ]
    }

    fn config() -> EngineConfig {
        EngineConfig::new("map", "position", "mmsi", "mmsi")
    }

    fn paris() -> BoundingBox {
        BoundingBox::new(48.9, 2.3, 48.8, 2.4)
    }

    /// Fails every search, counts aggregates.
    #[derive(Debug, Default)]
    struct FailingSearch {
        inner: MemoryBackend,
        failures: AtomicUsize,
    }

    impl SearchBackend for FailingSearch {
        fn aggregate(
            &self,
            req: AggregateRequest,
        ) -> BoxFuture<'_, Result<AggregateResponse, BackendError>> {
            self.inner.aggregate(req)
        }

        fn search(
            &self,
            _req: SearchRequest,
        ) -> BoxFuture<'_, Result<SearchResponse, BackendError>> {
            self.failures.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::ready(Err(BackendError::Status {
                status: 500,
                message: "shard failure".into(),
            })))
        }
    }

    #[tokio::test]
    async fn exact_features_reach_the_render_model() {
        let backend = Arc::new(MemoryBackend::new(records()));
        let bus = Arc::new(SharedFilterBus::new());
        let (errors, _rx) = ErrorChannel::new();
        let engine = spawn(config(), 0.0, backend.clone(), bus, errors).expect("valid config");

        let mut redraw = engine.on_redraw();
        engine
            .viewport_changed(Viewport::new(14.0, paris()))
            .await
            .expect("running");
        engine.settled().await.expect("running");

        assert!(redraw.has_changed().unwrap_or(false));
        let model = redraw.borrow_and_update().clone();
        let mut ids: Vec<&str> = model.ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let status = *engine.status().borrow();
        assert_eq!(status.strategy, Strategy::ExactFeatureSearch);
        assert_eq!(status.phase, Phase::Idle);
        assert_eq!(status.rendered, 3);

        // Same view again: probe only, every tile is already resident.
        let searches = backend.search_calls();
        engine
            .viewport_changed(Viewport::new(14.0, paris()))
            .await
            .expect("running");
        engine.settled().await.expect("running");
        assert_eq!(backend.search_calls(), searches);
        assert_eq!(engine.render_model().len(), 3);
    }

    #[tokio::test]
    async fn failed_tiles_are_reported_and_state_returns_idle() {
        let backend = Arc::new(FailingSearch {
            inner: MemoryBackend::new(records()),
            ..FailingSearch::default()
        });
        let bus = Arc::new(SharedFilterBus::new());
        let (errors, mut error_rx) = ErrorChannel::new();
        let engine = spawn(config(), 0.0, backend.clone(), bus, errors).expect("valid config");

        engine
            .viewport_changed(Viewport::new(14.0, paris()))
            .await
            .expect("running");
        engine.settled().await.expect("running");

        let failures = backend.failures.load(Ordering::SeqCst);
        assert!(failures > 0);
        let mut reported = 0;
        while let Ok(err) = error_rx.try_recv() {
            assert!(matches!(err, EngineError::Fetch { .. }));
            reported += 1;
        }
        assert_eq!(reported, failures);
        assert!(engine.render_model().is_empty());
        assert_eq!(engine.status().borrow().phase, Phase::Idle);

        // Failed tiles are not known, so the next event asks for them again.
        engine
            .viewport_changed(Viewport::new(14.0, paris()))
            .await
            .expect("running");
        engine.settled().await.expect("running");
        assert_eq!(backend.failures.load(Ordering::SeqCst), failures * 2);
    }

    #[tokio::test]
    async fn selection_box_is_published_and_removed() {
        let backend = Arc::new(MemoryBackend::new(records()));
        let bus = Arc::new(SharedFilterBus::new());
        let (errors, _rx) = ErrorChannel::new();
        let engine = spawn(config(), 0.0, backend, bus.clone(), errors).expect("valid config");
        let me = WidgetId::new("map");

        engine
            .viewport_changed(Viewport::new(8.0, paris()).pinned())
            .await
            .expect("running");
        engine.settled().await.expect("running");
        assert_eq!(
            bus.current_filter(&me),
            Some(FilterExpression::Extent { extent: paris() })
        );
        // Wait for our own filter to come back over the bus, then check it was
        // not taken for a peer change.
        let counter = |snapshot: &MetricsSnapshot, name: &str| {
            snapshot
                .counters
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        };
        let snapshot = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = engine.metrics().await.expect("running");
                if counter(&snapshot, "own_filter_echoes") > 0 {
                    return snapshot;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("own filter echoed");
        assert_eq!(counter(&snapshot, "own_filter_echoes"), 1);
        assert_eq!(counter(&snapshot, "filter_events"), 0);
        let generation = engine.status().borrow().generation;

        engine.selection_box_removed().await.expect("running");
        engine.settled().await.expect("running");
        assert_eq!(bus.current_filter(&me), None);
        // Only the removal itself advanced the generation.
        assert_eq!(engine.status().borrow().generation, generation + 1);
    }

    #[tokio::test]
    async fn peer_filter_forces_recompute_with_filter_attached() {
        let backend = Arc::new(MemoryBackend::new(records()));
        let bus = Arc::new(SharedFilterBus::new());
        let (errors, _rx) = ErrorChannel::new();
        let engine = spawn(config(), 0.0, backend.clone(), bus.clone(), errors)
            .expect("valid config");

        engine
            .viewport_changed(Viewport::new(14.0, paris()))
            .await
            .expect("running");
        engine.settled().await.expect("running");
        assert_eq!(engine.render_model().len(), 3);

        let mut status = engine.status();
        let generation = status.borrow_and_update().generation;
        bus.publish_filter(
            &WidgetId::new("donut"),
            FilterExpression::Terms {
                field: "kind".into(),
                values: vec![json!("cargo")],
            },
        );
        status
            .wait_for(|s| s.generation > generation)
            .await
            .expect("engine running");
        engine.settled().await.expect("running");

        let model = engine.render_model();
        let mut ids: Vec<&str> = model.ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_spawn() {
        let mut cfg = config();
        cfg.test_count_zoom = 3.0;
        let (errors, _rx) = ErrorChannel::new();
        let result = spawn(
            cfg,
            0.0,
            Arc::new(MemoryBackend::default()),
            Arc::new(SharedFilterBus::new()),
            errors,
        );
        assert!(result.is_err());
    }
}
