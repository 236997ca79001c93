//! Scripted replay of map events against an engine.
//!
//! A script is a JSON array of events:
//!
//! ```json
//! [
//!   {"type": "viewport", "zoom": 8, "extent": {"north": 49, "west": 2, "south": 48.7, "east": 2.6}},
//!   {"type": "peer_filter", "owner": "donut", "filter": {"type": "terms", "field": "kind", "values": ["cargo"]}},
//!   {"type": "clear_peer_filter", "owner": "donut"},
//!   {"type": "selection_removed"}
//! ]
//! ```

use std::path::Path;

use engine::{EngineError, EngineHandle, EngineStatus, Viewport};
use foundation::bounds::BoundingBox;
use foundation::tile::TileKey;
use runtime::filter_bus::{FilterBus, FilterExpression, WidgetId};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Config(#[from] engine::ConfigError),
    #[error(transparent)]
    Backend(#[from] streaming::backend::BackendError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("either --data or --backend-url is required")]
    NoBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptEvent {
    Viewport {
        zoom: f64,
        extent: BoundingBox,
        #[serde(default)]
        tiles: Vec<TileKey>,
        #[serde(default)]
        pinned: bool,
    },
    SelectionRemoved,
    /// Another widget publishes a filter.
    PeerFilter {
        owner: String,
        filter: FilterExpression,
    },
    ClearPeerFilter {
        owner: String,
    },
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ToolError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ToolError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_json(&raw, &path.display().to_string())
}

pub fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, origin: &str) -> Result<T, ToolError> {
    serde_json::from_str(raw).map_err(|source| ToolError::Json {
        path: origin.to_string(),
        source,
    })
}

/// State of the engine after one event settled.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayStep {
    pub index: usize,
    pub status: EngineStatus,
}

/// Feed `events` to the engine, waiting for each to settle before the next.
pub async fn replay(
    engine: &EngineHandle,
    bus: &dyn FilterBus,
    events: Vec<ScriptEvent>,
) -> Result<Vec<ReplayStep>, ToolError> {
    let mut steps = Vec::with_capacity(events.len());
    let mut status = engine.status();

    for (index, event) in events.into_iter().enumerate() {
        let before = status.borrow_and_update().generation;
        match event {
            ScriptEvent::Viewport {
                zoom,
                extent,
                tiles,
                pinned,
            } => {
                let mut vp = Viewport::new(zoom, extent).with_tiles(tiles);
                vp.pinned_extent = pinned;
                engine.viewport_changed(vp).await?;
            }
            ScriptEvent::SelectionRemoved => engine.selection_box_removed().await?,
            ScriptEvent::PeerFilter { owner, filter } => {
                bus.publish_filter(&WidgetId::new(owner), filter);
                wait_for_generation(&mut status, before).await?;
            }
            ScriptEvent::ClearPeerFilter { owner } => {
                let owner = WidgetId::new(owner);
                // Removing an absent filter emits nothing, so there is nothing to wait for.
                if bus.current_filter(&owner).is_some() {
                    bus.remove_filter(&owner);
                    wait_for_generation(&mut status, before).await?;
                }
            }
        }
        engine.settled().await?;

        let step = ReplayStep {
            index,
            status: *status.borrow_and_update(),
        };
        info!(
            index,
            phase = ?step.status.phase,
            strategy = ?step.status.strategy,
            rendered = step.status.rendered,
            "event settled"
        );
        steps.push(step);
    }
    Ok(steps)
}

async fn wait_for_generation(
    status: &mut tokio::sync::watch::Receiver<EngineStatus>,
    before: u64,
) -> Result<(), EngineError> {
    status
        .wait_for(|s| s.generation > before)
        .await
        .map(|_| ())
        .map_err(|_| EngineError::Closed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ScriptEvent, parse_json, replay};
    use engine::{EngineConfig, ErrorChannel, Strategy, spawn};
    use foundation::bounds::BoundingBox;
    use pretty_assertions::assert_eq;
    use runtime::filter_bus::{FilterExpression, SharedFilterBus};
    use serde_json::json;
    use streaming::memory::MemoryBackend;

    fn dataset() -> MemoryBackend {
        MemoryBackend::from_geojson(&json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "id": "a", "geometry": {"type": "Point", "coordinates": [2.35, 48.85]}, "properties": {"mmsi": "a", "kind": "cargo"}},
                {"type": "Feature", "id": "b", "geometry": {"type": "Point", "coordinates": [2.36, 48.86]}, "properties": {"mmsi": "b", "kind": "tanker"}},
                {"type": "Feature", "id": "c", "geometry": {"type": "Point", "coordinates": [-74.0, 40.7]}, "properties": {"mmsi": "c", "kind": "cargo"}}
            ]
        }))
        .expect("points")
    }

    #[test]
    fn script_events_parse() {
        let events: Vec<ScriptEvent> = parse_json(
            r#"[
                {"type": "viewport", "zoom": 8, "extent": {"north": 49, "west": 2, "south": 48.7, "east": 2.6}, "tiles": [{"geohash": "u09t"}]},
                {"type": "peer_filter", "owner": "donut", "filter": {"type": "terms", "field": "kind", "values": ["cargo"]}},
                {"type": "clear_peer_filter", "owner": "donut"},
                {"type": "selection_removed"}
            ]"#,
            "inline",
        )
        .expect("valid script");
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            ScriptEvent::Viewport { tiles, pinned: false, .. } if tiles.len() == 1
        ));
        assert_eq!(events[3], ScriptEvent::SelectionRemoved);
    }

    #[test]
    fn bad_json_names_its_origin() {
        let err = parse_json::<Vec<ScriptEvent>>("[{]", "events.json").unwrap_err();
        assert!(err.to_string().starts_with("invalid JSON in events.json"));
    }

    #[tokio::test]
    async fn replay_runs_every_event_to_settlement() {
        let bus = Arc::new(SharedFilterBus::new());
        let (errors, _rx) = ErrorChannel::new();
        let config = EngineConfig::new("map", "position", "mmsi", "mmsi");
        let engine = spawn(config, 0.0, Arc::new(dataset()), bus.clone(), errors).expect("valid");

        let paris = BoundingBox::new(48.9, 2.3, 48.8, 2.4);
        let events = vec![
            ScriptEvent::Viewport {
                zoom: 2.0,
                extent: BoundingBox::world(),
                tiles: vec![],
                pinned: false,
            },
            ScriptEvent::Viewport {
                zoom: 14.0,
                extent: paris,
                tiles: vec![],
                pinned: false,
            },
            ScriptEvent::PeerFilter {
                owner: "donut".into(),
                filter: FilterExpression::Terms {
                    field: "kind".into(),
                    values: vec![json!("tanker")],
                },
            },
            ScriptEvent::ClearPeerFilter {
                owner: "donut".into(),
            },
            ScriptEvent::ClearPeerFilter {
                owner: "donut".into(),
            },
        ];

        let steps = replay(&engine, bus.as_ref(), events).await.expect("replayed");
        let rendered: Vec<usize> = steps.iter().map(|s| s.status.rendered).collect();
        // World clusters, Paris exact points, tanker only, both again, unchanged.
        assert_eq!(rendered, vec![2, 2, 1, 2, 2]);
        assert_eq!(steps[1].status.strategy, Strategy::ExactFeatureSearch);
    }
}
