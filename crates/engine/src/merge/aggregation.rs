//! Cluster responses to features.
//!
//! Counts are normalized against the running maximum held by the cache. The
//! maximum only grows until the next purge and features already rendered keep
//! the value computed when they arrived.

use foundation::bounds::BoundingBox;
use foundation::geohash::{self, MAX_PRECISION};
use runtime::filter_bus::FilterExpression;
use serde_json::{Map, Value, json};
use streaming::cache::TileFeatureCache;
use streaming::protocol::{
    AggregateRequest, AggregateResponse, Bucket, CellSpec, MetricKind, MetricValue, TermSpec,
};
use tracing::warn;

use crate::config::{AggregationMode, EngineConfig};
use crate::render::FeatureRecord;

/// Geohash length of aggregation cells for a tile precision.
pub fn aggregation_precision(config: &EngineConfig, precision: u8) -> u8 {
    precision
        .saturating_add(config.aggregation_precision_offset)
        .min(MAX_PRECISION)
}

pub fn aggregate_request(
    config: &EngineConfig,
    extent: Option<BoundingBox>,
    precision: u8,
    filters: Vec<FilterExpression>,
) -> AggregateRequest {
    let term = match &config.aggregation {
        AggregationMode::Cluster => None,
        AggregationMode::Hierarchical { term_field, size } => Some(TermSpec {
            field: term_field.clone(),
            size: *size,
        }),
    };
    AggregateRequest {
        extent,
        geometry_field: config.geometry_field.clone(),
        cell: CellSpec {
            precision: aggregation_precision(config, precision),
            term,
        },
        metrics: config.metrics.clone(),
        filters,
    }
}

/// Features for one aggregate response.
///
/// Every count of the response is folded into the running maximum before
/// any feature of it is normalized.
pub fn merge_aggregation(
    config: &EngineConfig,
    response: &AggregateResponse,
    cache: &mut TileFeatureCache,
) -> Vec<FeatureRecord> {
    match &config.aggregation {
        AggregationMode::Cluster => {
            for cell in &response.elements {
                cache.observe_count(cell.count);
            }
            let max = cache.max_count();
            response
                .elements
                .iter()
                .filter_map(|cell| {
                    let geometry = cell_geometry(cell)?;
                    Some(feature(geometry, cell, &cell.key, max))
                })
                .collect()
        }
        AggregationMode::Hierarchical { term_field, .. } => {
            for leaf in response.elements.iter().flat_map(leaves) {
                cache.observe_count(leaf.count);
            }
            let max = cache.max_count();
            let mut out = Vec::new();
            for cell in &response.elements {
                let Some(geometry) = cell_geometry(cell) else {
                    continue;
                };
                for leaf in leaves(cell) {
                    let leaf_geometry = centroid(leaf).unwrap_or_else(|| geometry.clone());
                    let mut f = feature(leaf_geometry, leaf, &cell.key, max);
                    f.properties
                        .insert(term_field.clone(), Value::String(leaf.key.clone()));
                    out.push(f);
                }
            }
            out
        }
    }
}

fn leaves(cell: &Bucket) -> impl Iterator<Item = &Bucket> {
    cell.elements.iter().flatten()
}

fn feature(geometry: Value, bucket: &Bucket, cell_key: &str, max: u64) -> FeatureRecord {
    let mut properties = Map::new();
    properties.insert("count".into(), json!(bucket.count));
    properties.insert("normalizedCount".into(), json!(normalize(bucket.count, max)));
    properties.insert("geohash".into(), Value::String(cell_key.to_string()));
    flatten_metrics(&bucket.metrics, &mut properties);
    FeatureRecord {
        id: None,
        geometry,
        properties,
    }
}

fn normalize(count: u64, max: u64) -> f64 {
    if max == 0 {
        0.0
    } else {
        count as f64 / max as f64 * 100.0
    }
}

/// Metric values as `<field>_<kind>` properties. Centroids become the geometry instead.
fn flatten_metrics(metrics: &[MetricValue], properties: &mut Map<String, Value>) {
    for m in metrics {
        if m.kind == MetricKind::Geocentroid {
            continue;
        }
        properties.insert(format!("{}_{}", m.field, m.kind.as_str()), m.value.clone());
    }
}

fn cell_geometry(cell: &Bucket) -> Option<Value> {
    if let Some(point) = centroid(cell) {
        return Some(point);
    }
    match geohash::decode_center(&cell.key) {
        Some(center) => Some(point(center.lon, center.lat)),
        None => {
            warn!(key = %cell.key, "dropping aggregation cell with an invalid geohash");
            None
        }
    }
}

/// Centroid metric as a point. Accepts a GeoJSON point or a `{lat, lon}` object.
fn centroid(bucket: &Bucket) -> Option<Value> {
    let value = bucket
        .metrics
        .iter()
        .find(|m| m.kind == MetricKind::Geocentroid)
        .map(|m| &m.value)?;

    if value.get("type").and_then(Value::as_str) == Some("Point") {
        return Some(value.clone());
    }
    let lon = value.get("lon").and_then(Value::as_f64)?;
    let lat = value.get("lat").and_then(Value::as_f64)?;
    Some(point(lon, lat))
}

fn point(lon: f64, lat: f64) -> Value {
    json!({"type": "Point", "coordinates": [lon, lat]})
}
