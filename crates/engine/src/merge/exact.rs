use foundation::bounds::BoundingBox;
use foundation::tile::TileKey;
use runtime::filter_bus::FilterExpression;
use serde_json::Value;
use streaming::cache::TileFeatureCache;
use streaming::protocol::{RemoteFeature, SearchRequest, SearchResponse};

use crate::config::EngineConfig;
use crate::render::FeatureRecord;

/// Bounded search for one tile, asking only for render and id fields.
pub fn search_request(
    config: &EngineConfig,
    extent: BoundingBox,
    filters: Vec<FilterExpression>,
) -> SearchRequest {
    SearchRequest {
        extent: Some(extent),
        geometry_field: config.geometry_field.clone(),
        fields: config.search_fields(),
        page_size: usize::try_from(config.max_features_for_cluster).unwrap_or(usize::MAX),
        filters,
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ExactMerge {
    /// Features not seen before, in response order.
    pub accepted: Vec<FeatureRecord>,
    /// Features another tile already contributed.
    pub duplicates: usize,
    /// Features without a usable identifier; they cannot be deduplicated and are dropped.
    pub missing_id: usize,
}

pub fn merge_exact(
    config: &EngineConfig,
    tile: &TileKey,
    response: SearchResponse,
    cache: &mut TileFeatureCache,
) -> ExactMerge {
    let mut out = ExactMerge::default();
    for remote in response.features {
        let Some(id) = feature_id(&config.id_field, &remote) else {
            out.missing_id += 1;
            continue;
        };
        if !cache.insert_feature(tile, &id) {
            out.duplicates += 1;
            continue;
        }
        out.accepted.push(FeatureRecord {
            id: Some(id),
            geometry: remote.geometry,
            properties: remote.data,
        });
    }
    out
}

/// Identifier from the configured field, falling back to the backend's own id.
fn feature_id(id_field: &str, feature: &RemoteFeature) -> Option<String> {
    match feature.data.get(id_field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => feature.id.clone(),
    }
}
