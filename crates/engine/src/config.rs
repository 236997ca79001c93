use std::path::Path;

use serde::{Deserialize, Serialize};
use streaming::protocol::MetricSpec;

use crate::error::ConfigError;

/// Shape of the cluster aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AggregationMode {
    /// One feature per geohash cell.
    Cluster,
    /// One feature per term bucket inside each geohash cell.
    Hierarchical {
        term_field: String,
        #[serde(default = "default_term_size")]
        size: usize,
    },
}

fn default_term_size() -> usize {
    10
}

fn default_max_features_for_cluster() -> u64 {
    1000
}

fn default_full_data_zoom() -> f64 {
    7.0
}

fn default_test_count_zoom() -> f64 {
    11.0
}

fn default_aggregation_precision_offset() -> u8 {
    2
}

fn default_max_tiles_per_view() -> usize {
    64
}

fn default_aggregation() -> AggregationMode {
    AggregationMode::Cluster
}

/// Per-visual engine configuration, validated once at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Identity of this visual on the collaborative filter bus.
    pub widget_id: String,
    pub geometry_field: String,
    /// Field whose value identifies an exact feature; the deduplication key.
    pub id_field: String,
    /// High-cardinality field counted by the probe.
    pub cardinality_field: String,
    #[serde(default = "default_max_features_for_cluster")]
    pub max_features_for_cluster: u64,
    /// Below this zoom every event is a full low-precision redraw.
    #[serde(default = "default_full_data_zoom")]
    pub full_data_zoom: f64,
    /// From this zoom on, a cardinality probe picks the strategy.
    #[serde(default = "default_test_count_zoom")]
    pub test_count_zoom: f64,
    /// Below this zoom nothing is fetched.
    #[serde(default)]
    pub min_zoom: Option<f64>,
    #[serde(default = "default_aggregation_precision_offset")]
    pub aggregation_precision_offset: u8,
    /// Upper bound on derived tiles per view. Large extents are tiled with
    /// coarser geohashes so the fan-out stays under it.
    #[serde(default = "default_max_tiles_per_view")]
    pub max_tiles_per_view: usize,
    #[serde(default)]
    pub render_fields: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default = "default_aggregation")]
    pub aggregation: AggregationMode,
}

impl EngineConfig {
    /// Minimal configuration with every optional value at its default.
    pub fn new(
        widget_id: impl Into<String>,
        geometry_field: impl Into<String>,
        id_field: impl Into<String>,
        cardinality_field: impl Into<String>,
    ) -> Self {
        Self {
            widget_id: widget_id.into(),
            geometry_field: geometry_field.into(),
            id_field: id_field.into(),
            cardinality_field: cardinality_field.into(),
            max_features_for_cluster: default_max_features_for_cluster(),
            full_data_zoom: default_full_data_zoom(),
            test_count_zoom: default_test_count_zoom(),
            min_zoom: None,
            aggregation_precision_offset: default_aggregation_precision_offset(),
            max_tiles_per_view: default_max_tiles_per_view(),
            render_fields: Vec::new(),
            metrics: Vec::new(),
            aggregation: AggregationMode::Cluster,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("widget_id", &self.widget_id),
            ("geometry_field", &self.geometry_field),
            ("id_field", &self.id_field),
            ("cardinality_field", &self.cardinality_field),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        let limits = [
            ("max_features_for_cluster", self.max_features_for_cluster),
            ("max_tiles_per_view", self.max_tiles_per_view as u64),
        ];
        for (name, limit) in limits {
            if limit == 0 {
                return Err(ConfigError::Invalid {
                    field: name,
                    reason: "must be greater than zero".into(),
                });
            }
        }

        let zooms = [
            ("full_data_zoom", self.full_data_zoom),
            ("test_count_zoom", self.test_count_zoom),
        ];
        for (name, zoom) in zooms {
            if !zoom.is_finite() || zoom < 0.0 {
                return Err(ConfigError::Invalid {
                    field: name,
                    reason: format!("expected a non-negative zoom, got {zoom}"),
                });
            }
        }
        if self.full_data_zoom > self.test_count_zoom {
            return Err(ConfigError::Invalid {
                field: "full_data_zoom",
                reason: format!(
                    "{} is above test_count_zoom {}",
                    self.full_data_zoom, self.test_count_zoom
                ),
            });
        }
        match self.min_zoom {
            Some(min) if min > self.full_data_zoom => {
                return Err(ConfigError::Invalid {
                    field: "min_zoom",
                    reason: format!("{min} is above full_data_zoom {}", self.full_data_zoom),
                });
            }
            _ => {}
        }

        if let AggregationMode::Hierarchical { term_field, size } = &self.aggregation {
            if term_field.trim().is_empty() {
                return Err(ConfigError::Missing("aggregation.term_field"));
            }
            if *size == 0 {
                return Err(ConfigError::Invalid {
                    field: "aggregation.size",
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// Fields requested by exact searches: the render fields plus the id field.
    pub fn search_fields(&self) -> Vec<String> {
        let mut fields = self.render_fields.clone();
        if !fields.iter().any(|f| f == &self.id_field) {
            fields.push(self.id_field.clone());
        }
        fields
    }
}
