//! Collaborative filter bus shared by the widgets of one dashboard.
//!
//! Every widget owns at most one filter, keyed by its [`WidgetId`]. Changes are
//! broadcast to all subscribers; each subscription knows its own widget id and
//! tags incoming events as self-originated or peer-originated, so consumers
//! never compare identities themselves.

use std::collections::BTreeMap;
use std::fmt;

use foundation::bounds::BoundingBox;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;

/// Stable identity of a widget on the bus.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetId(String);

impl WidgetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WidgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A widget's contribution to the shared query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterExpression {
    /// Restrict to items whose geometry lies in the box.
    Extent { extent: BoundingBox },
    /// Restrict to items whose `field` equals one of `values`.
    Terms {
        field: String,
        values: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterChange {
    Published(FilterExpression),
    Removed,
    /// Events were dropped because the subscriber fell behind; state must be re-read.
    Resync,
}

#[derive(Debug, Clone, PartialEq)]
struct FilterEvent {
    owner: WidgetId,
    change: FilterChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    SelfOriginated,
    Peer(WidgetId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedFilterEvent {
    pub origin: Origin,
    pub change: FilterChange,
}

impl TaggedFilterEvent {
    pub fn is_peer(&self) -> bool {
        matches!(self.origin, Origin::Peer(_))
    }
}

/// Publish/subscribe interface over the shared filter state.
pub trait FilterBus: Send + Sync {
    fn subscribe(&self, me: &WidgetId) -> FilterSubscription;

    fn publish_filter(&self, owner: &WidgetId, filter: FilterExpression);

    fn remove_filter(&self, owner: &WidgetId);

    fn current_filter(&self, owner: &WidgetId) -> Option<FilterExpression>;

    /// Filters currently held by every widget other than `me`, in owner order.
    fn peer_filters(&self, me: &WidgetId) -> Vec<FilterExpression>;
}

/// In-process [`FilterBus`] backed by a tokio broadcast channel.
#[derive(Debug)]
pub struct SharedFilterBus {
    filters: RwLock<BTreeMap<WidgetId, FilterExpression>>,
    tx: broadcast::Sender<FilterEvent>,
}

impl SharedFilterBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            filters: RwLock::new(BTreeMap::new()),
            tx,
        }
    }

    fn emit(&self, owner: &WidgetId, change: FilterChange) {
        // No subscribers is not an error: nobody needs to hear about it.
        let receivers = self
            .tx
            .send(FilterEvent {
                owner: owner.clone(),
                change,
            })
            .unwrap_or(0);
        debug!(owner = %owner, receivers, "filter change broadcast");
    }
}

impl Default for SharedFilterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterBus for SharedFilterBus {
    fn subscribe(&self, me: &WidgetId) -> FilterSubscription {
        FilterSubscription {
            me: me.clone(),
            rx: self.tx.subscribe(),
        }
    }

    fn publish_filter(&self, owner: &WidgetId, filter: FilterExpression) {
        self.filters.write().insert(owner.clone(), filter.clone());
        self.emit(owner, FilterChange::Published(filter));
    }

    fn remove_filter(&self, owner: &WidgetId) {
        let removed = self.filters.write().remove(owner);
        if removed.is_some() {
            self.emit(owner, FilterChange::Removed);
        }
    }

    fn current_filter(&self, owner: &WidgetId) -> Option<FilterExpression> {
        self.filters.read().get(owner).cloned()
    }

    fn peer_filters(&self, me: &WidgetId) -> Vec<FilterExpression> {
        self.filters
            .read()
            .iter()
            .filter(|(owner, _)| *owner != me)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

/// One widget's view of the bus.
#[derive(Debug)]
pub struct FilterSubscription {
    me: WidgetId,
    rx: broadcast::Receiver<FilterEvent>,
}

impl FilterSubscription {
    pub fn widget(&self) -> &WidgetId {
        &self.me
    }

    fn tag(&self, event: FilterEvent) -> TaggedFilterEvent {
        let origin = if event.owner == self.me {
            Origin::SelfOriginated
        } else {
            Origin::Peer(event.owner)
        };
        TaggedFilterEvent {
            origin,
            change: event.change,
        }
    }

    fn lagged(&self, skipped: u64) -> TaggedFilterEvent {
        warn!(widget = %self.me, skipped, "filter subscription lagged");
        TaggedFilterEvent {
            origin: Origin::Peer(WidgetId::new("*")),
            change: FilterChange::Resync,
        }
    }

    /// Next event, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<TaggedFilterEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(self.tag(event)),
            Err(RecvError::Lagged(skipped)) => Some(self.lagged(skipped)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of [`FilterSubscription::recv`].
    pub fn try_recv(&mut self) -> Option<TaggedFilterEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(self.tag(event)),
            Err(TryRecvError::Lagged(skipped)) => Some(self.lagged(skipped)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterBus, FilterChange, FilterExpression, Origin, SharedFilterBus, WidgetId};
    use foundation::bounds::BoundingBox;
    use pretty_assertions::assert_eq;

    fn extent_filter() -> FilterExpression {
        FilterExpression::Extent {
            extent: BoundingBox::new(1.0, 0.0, 0.0, 1.0),
        }
    }

    #[test]
    fn events_are_tagged_by_origin() {
        let bus = SharedFilterBus::new();
        let map = WidgetId::new("map");
        let donut = WidgetId::new("donut");
        let mut sub = bus.subscribe(&map);

        bus.publish_filter(&map, extent_filter());
        bus.publish_filter(
            &donut,
            FilterExpression::Terms {
                field: "kind".into(),
                values: vec!["ship".into()],
            },
        );

        let first = sub.try_recv().expect("self event");
        assert_eq!(first.origin, Origin::SelfOriginated);
        assert!(!first.is_peer());

        let second = sub.try_recv().expect("peer event");
        assert_eq!(second.origin, Origin::Peer(donut.clone()));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn peer_filters_exclude_own() {
        let bus = SharedFilterBus::new();
        let map = WidgetId::new("map");
        let donut = WidgetId::new("donut");
        bus.publish_filter(&map, extent_filter());
        bus.publish_filter(
            &donut,
            FilterExpression::Terms {
                field: "kind".into(),
                values: vec![],
            },
        );

        assert_eq!(bus.peer_filters(&map).len(), 1);
        assert_eq!(bus.current_filter(&map), Some(extent_filter()));
    }

    #[test]
    fn removing_absent_filter_is_silent() {
        let bus = SharedFilterBus::new();
        let map = WidgetId::new("map");
        let mut sub = bus.subscribe(&map);
        bus.remove_filter(&map);
        assert!(sub.try_recv().is_none());

        bus.publish_filter(&map, extent_filter());
        bus.remove_filter(&map);
        let _published = sub.try_recv();
        let removed = sub.try_recv().expect("removed event");
        assert_eq!(removed.change, FilterChange::Removed);
        assert_eq!(bus.current_filter(&map), None);
    }

    #[test]
    fn lagging_subscriber_gets_resync() {
        let bus = SharedFilterBus::with_capacity(1);
        let me = WidgetId::new("map");
        let peer = WidgetId::new("peer");
        let mut sub = bus.subscribe(&me);
        bus.publish_filter(&peer, extent_filter());
        bus.publish_filter(&peer, extent_filter());

        let ev = sub.try_recv().expect("resync");
        assert_eq!(ev.change, FilterChange::Resync);
        assert!(ev.is_peer());
    }

    #[tokio::test]
    async fn recv_returns_none_once_bus_is_dropped() {
        let bus = SharedFilterBus::new();
        let mut sub = bus.subscribe(&WidgetId::new("map"));
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
