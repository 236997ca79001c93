//! Cardinality probe: one interval-1 aggregation that estimates how many
//! distinct items the query extent holds.

use foundation::bounds::BoundingBox;
use foundation::precision::MIN_PRECISION;
use runtime::filter_bus::FilterExpression;
use streaming::protocol::{AggregateRequest, AggregateResponse, CellSpec, MetricKind, MetricSpec};

use crate::config::EngineConfig;

pub fn probe_request(
    config: &EngineConfig,
    extent: Option<BoundingBox>,
    filters: Vec<FilterExpression>,
) -> AggregateRequest {
    AggregateRequest {
        extent,
        geometry_field: config.geometry_field.clone(),
        cell: CellSpec {
            precision: MIN_PRECISION,
            term: None,
        },
        metrics: vec![MetricSpec::new(
            config.cardinality_field.clone(),
            MetricKind::Cardinality,
        )],
        filters,
    }
}

/// Sum of the cardinality metric over every returned cell.
pub fn estimated_count(config: &EngineConfig, response: &AggregateResponse) -> u64 {
    let total = response.metric_sum(&config.cardinality_field, MetricKind::Cardinality);
    if total.is_finite() && total > 0.0 {
        total.round() as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::{estimated_count, probe_request};
    use crate::config::EngineConfig;
    use foundation::bounds::BoundingBox;
    use serde_json::json;
    use streaming::protocol::{AggregateResponse, Bucket, MetricKind, MetricValue};

    fn cell(key: &str, distinct: serde_json::Value) -> Bucket {
        Bucket {
            key: key.into(),
            count: 10,
            metrics: vec![MetricValue {
                field: "mmsi".into(),
                kind: MetricKind::Cardinality,
                value: distinct,
            }],
            elements: None,
        }
    }

    #[test]
    fn request_is_single_cell_cardinality() {
        let cfg = EngineConfig::new("map", "position", "id", "mmsi");
        let extent = BoundingBox::new(1.0, 0.0, 0.0, 1.0);
        let req = probe_request(&cfg, Some(extent), vec![]);
        assert_eq!(req.cell.precision, 1);
        assert_eq!(req.extent, Some(extent));
        assert_eq!(req.metrics.len(), 1);
        assert_eq!(req.metrics[0].field, "mmsi");
        assert_eq!(req.metrics[0].kind, MetricKind::Cardinality);
    }

    #[test]
    fn estimate_sums_cells_and_ignores_garbage() {
        let cfg = EngineConfig::new("map", "position", "id", "mmsi");
        let response = AggregateResponse {
            elements: vec![cell("u", json!(3)), cell("e", json!(2)), cell("s", json!("n/a"))],
            sum_other_count: 0,
        };
        assert_eq!(estimated_count(&cfg, &response), 5);
        assert_eq!(estimated_count(&cfg, &AggregateResponse::default()), 0);
    }
}
