//! Wire types for the search/aggregation backend.
//!
//! Two operations only:
//! - `aggregate`: geohash cells (optionally split by a term field) with counts
//!   and metrics.
//! - `search`: raw features restricted to an extent, one page.
//!
//! Both carry the peer filters currently held on the collaborative bus.

use foundation::bounds::BoundingBox;
use runtime::filter_bus::FilterExpression;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cardinality,
    Sum,
    Avg,
    Min,
    Max,
    Geocentroid,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Cardinality => "cardinality",
            MetricKind::Sum => "sum",
            MetricKind::Avg => "avg",
            MetricKind::Min => "min",
            MetricKind::Max => "max",
            MetricKind::Geocentroid => "geocentroid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub field: String,
    pub kind: MetricKind,
}

impl MetricSpec {
    pub fn new(field: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            field: field.into(),
            kind,
        }
    }
}

/// Split of each geohash cell into term buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSpec {
    pub field: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellSpec {
    /// Geohash length of the aggregation cells (the interval).
    pub precision: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<TermSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {
    /// `None` aggregates the whole collection.
    pub extent: Option<BoundingBox>,
    pub geometry_field: String,
    pub cell: CellSpec,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub filters: Vec<FilterExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub field: String,
    pub kind: MetricKind,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: String,
    pub count: u64,
    #[serde(default)]
    pub metrics: Vec<MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<Bucket>>,
}

impl Bucket {
    pub fn metric(&self, field: &str, kind: MetricKind) -> Option<&serde_json::Value> {
        self.metrics
            .iter()
            .find(|m| m.kind == kind && m.field == field)
            .map(|m| &m.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    #[serde(default)]
    pub elements: Vec<Bucket>,
    #[serde(default)]
    pub sum_other_count: u64,
}

impl AggregateResponse {
    /// Sum of a numeric metric over the top-level cells. Non-numeric values count as zero.
    pub fn metric_sum(&self, field: &str, kind: MetricKind) -> f64 {
        self.elements
            .iter()
            .filter_map(|b| b.metric(field, kind))
            .filter_map(serde_json::Value::as_f64)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub extent: Option<BoundingBox>,
    pub geometry_field: String,
    /// Fields to return in each feature's `data`.
    pub fields: Vec<String>,
    pub page_size: usize,
    #[serde(default)]
    pub filters: Vec<FilterExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFeature {
    #[serde(default)]
    pub id: Option<String>,
    pub geometry: serde_json::Value,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub features: Vec<RemoteFeature>,
}
