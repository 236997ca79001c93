use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One drawable feature. Serializes as a GeoJSON `Feature`.
///
/// Cluster features have no `id`; exact features carry the configured
/// identifier, which is also their deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct FeatureRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub geometry: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl FeatureRecord {
    pub fn new(id: Option<String>, geometry: Value) -> Self {
        Self {
            id,
            geometry,
            properties: Map::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Feature collection handed to the UI layer.
///
/// Only the engine mutates it; readers get snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "FeatureCollection")]
pub struct RenderModel {
    features: Vec<FeatureRecord>,
}

impl RenderModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn features(&self) -> &[FeatureRecord] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Ids of the exact features, in render order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.features.iter().filter_map(|f| f.id.as_deref())
    }

    pub(crate) fn clear(&mut self) {
        self.features.clear();
    }

    pub(crate) fn replace(&mut self, features: Vec<FeatureRecord>) {
        self.features = features;
    }

    pub(crate) fn extend(&mut self, features: Vec<FeatureRecord>) {
        self.features.extend(features);
    }
}
