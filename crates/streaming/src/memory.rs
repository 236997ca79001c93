//! In-process backend over a point collection.
//!
//! Performs real geohash aggregation and extent search so the engine can run
//! without a search service (tests, the CLI replay tool).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use foundation::bounds::{BoundingBox, LonLat};
use foundation::geohash;
use runtime::filter_bus::FilterExpression;
use serde_json::{Map, Value, json};

use crate::backend::{BackendError, BoxFuture, SearchBackend};
use crate::protocol::{
    AggregateRequest, AggregateResponse, Bucket, MetricKind, MetricSpec, MetricValue,
    RemoteFeature, SearchRequest, SearchResponse,
};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRecord {
    pub id: Option<String>,
    pub position: LonLat,
    pub data: Map<String, Value>,
}

impl MemoryRecord {
    pub fn new(id: impl Into<String>, position: LonLat) -> Self {
        Self {
            id: Some(id.into()),
            position,
            data: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    fn matches(&self, filter: &FilterExpression) -> bool {
        match filter {
            FilterExpression::Extent { extent } => extent.contains_point(self.position),
            FilterExpression::Terms { field, values } => self
                .data
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Vec<MemoryRecord>,
    aggregate_calls: AtomicUsize,
    search_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new(records: Vec<MemoryRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Load a GeoJSON `FeatureCollection` of `Point` features.
    ///
    /// Feature `id` (string or number) becomes the record id; `properties`
    /// become the record data. Non-point features are rejected.
    pub fn from_geojson(value: &Value) -> Result<Self, BackendError> {
        let features = value
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| BackendError::Decode("expected a FeatureCollection".into()))?;

        let mut records = Vec::with_capacity(features.len());
        for (i, feature) in features.iter().enumerate() {
            let coords = feature
                .pointer("/geometry/coordinates")
                .and_then(Value::as_array)
                .filter(|_| feature.pointer("/geometry/type") == Some(&json!("Point")))
                .ok_or_else(|| BackendError::Decode(format!("feature {i} is not a Point")))?;
            let (Some(lon), Some(lat)) = (
                coords.first().and_then(Value::as_f64),
                coords.get(1).and_then(Value::as_f64),
            ) else {
                return Err(BackendError::Decode(format!(
                    "feature {i} has invalid coordinates"
                )));
            };

            let id = match feature.get("id") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            let data = feature
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            records.push(MemoryRecord {
                id,
                position: LonLat::new(lon, lat),
                data,
            });
        }
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    fn matching<'a>(
        &'a self,
        extent: Option<&'a BoundingBox>,
        filters: &'a [FilterExpression],
    ) -> impl Iterator<Item = &'a MemoryRecord> + 'a {
        self.records.iter().filter(move |r| {
            extent.map(|e| e.contains_point(r.position)).unwrap_or(true)
                && filters.iter().all(|f| r.matches(f))
        })
    }

    pub fn run_aggregate(&self, req: &AggregateRequest) -> AggregateResponse {
        let mut cells: BTreeMap<String, Vec<&MemoryRecord>> = BTreeMap::new();
        for r in self.matching(req.extent.as_ref(), &req.filters) {
            cells
                .entry(geohash::encode(r.position, req.cell.precision))
                .or_default()
                .push(r);
        }

        let mut sum_other_count = 0u64;
        let elements = cells
            .into_iter()
            .map(|(key, members)| {
                let elements = req.cell.term.as_ref().map(|term| {
                    let (buckets, other) =
                        term_buckets(&members, &term.field, term.size, &req.metrics);
                    sum_other_count += other;
                    buckets
                });
                Bucket {
                    key,
                    count: members.len() as u64,
                    metrics: compute_metrics(&members, &req.metrics),
                    elements,
                }
            })
            .collect();

        AggregateResponse {
            elements,
            sum_other_count,
        }
    }

    pub fn run_search(&self, req: &SearchRequest) -> SearchResponse {
        let features = self
            .matching(req.extent.as_ref(), &req.filters)
            .take(req.page_size)
            .map(|r| RemoteFeature {
                id: r.id.clone(),
                geometry: json!({"type": "Point", "coordinates": [r.position.lon, r.position.lat]}),
                data: req
                    .fields
                    .iter()
                    .filter_map(|f| r.data.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
            })
            .collect();
        SearchResponse { features }
    }
}

impl SearchBackend for MemoryBackend {
    fn aggregate(
        &self,
        req: AggregateRequest,
    ) -> BoxFuture<'_, Result<AggregateResponse, BackendError>> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::ready(Ok(self.run_aggregate(&req))))
    }

    fn search(&self, req: SearchRequest) -> BoxFuture<'_, Result<SearchResponse, BackendError>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(std::future::ready(Ok(self.run_search(&req))))
    }
}

fn term_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Top `size` term buckets by count (ties by key) and the count left over.
fn term_buckets(
    members: &[&MemoryRecord],
    field: &str,
    size: usize,
    metrics: &[MetricSpec],
) -> (Vec<Bucket>, u64) {
    let mut groups: BTreeMap<String, Vec<&MemoryRecord>> = BTreeMap::new();
    for r in members {
        if let Some(v) = r.data.get(field) {
            groups.entry(term_key(v)).or_default().push(*r);
        }
    }

    let mut ranked: Vec<(String, Vec<&MemoryRecord>)> = groups.into_iter().collect();
    ranked.sort_by(|(ka, a), (kb, b)| b.len().cmp(&a.len()).then_with(|| ka.cmp(kb)));

    let other: u64 = ranked.iter().skip(size).map(|(_, m)| m.len() as u64).sum();
    let buckets = ranked
        .into_iter()
        .take(size)
        .map(|(key, m)| Bucket {
            key,
            count: m.len() as u64,
            metrics: compute_metrics(&m, metrics),
            elements: None,
        })
        .collect();
    (buckets, other)
}

fn compute_metrics(members: &[&MemoryRecord], specs: &[MetricSpec]) -> Vec<MetricValue> {
    specs
        .iter()
        .map(|spec| MetricValue {
            field: spec.field.clone(),
            kind: spec.kind,
            value: compute_metric(members, spec),
        })
        .collect()
}

fn compute_metric(members: &[&MemoryRecord], spec: &MetricSpec) -> Value {
    let numbers = || {
        members
            .iter()
            .filter_map(|r| r.data.get(&spec.field).and_then(Value::as_f64))
    };

    match spec.kind {
        MetricKind::Cardinality => {
            let distinct: BTreeSet<String> = members
                .iter()
                .filter_map(|r| r.data.get(&spec.field).map(term_key))
                .collect();
            json!(distinct.len())
        }
        MetricKind::Sum => json!(numbers().sum::<f64>()),
        MetricKind::Avg => {
            let (sum, n) = numbers().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            if n == 0 { Value::Null } else { json!(sum / n as f64) }
        }
        MetricKind::Min => numbers().reduce(f64::min).map(|v| json!(v)).unwrap_or(Value::Null),
        MetricKind::Max => numbers().reduce(f64::max).map(|v| json!(v)).unwrap_or(Value::Null),
        MetricKind::Geocentroid => {
            if members.is_empty() {
                return Value::Null;
            }
            let n = members.len() as f64;
            let lon = members.iter().map(|r| r.position.lon).sum::<f64>() / n;
            let lat = members.iter().map(|r| r.position.lat).sum::<f64>() / n;
            json!({"type": "Point", "coordinates": [lon, lat]})
        }
    }
}
