//! Index settings: what the source says about an index, and what the
//! destination needs to recreate it.

use crate::client::SourceStore;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Field traversal is keyed on
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Settings of one concrete index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    pub index: String,
    /// `None` when the source did not report a usable count
    pub shards: Option<u32>,
    pub replicas: Option<u32>,
    pub mappings: Mappings,
    /// Passed through to the destination untouched
    pub aliases: Value,
}

/// `mappings` section. Only `properties` is interpreted; everything else
/// (`dynamic`, `_source`, ...) round-trips verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mappings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldMapping>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl FieldMapping {
    pub fn of_type(field_type: &str) -> Self {
        Self {
            field_type: Some(field_type.to_string()),
            other: Map::new(),
        }
    }
}

/// Body of `GET /{index}` for a single index
#[derive(Debug, Deserialize)]
pub struct EsIndexBody {
    #[serde(default)]
    pub aliases: Value,
    #[serde(default)]
    pub mappings: Mappings,
    #[serde(default)]
    pub settings: EsSettingsBody,
}

#[derive(Debug, Default, Deserialize)]
pub struct EsSettingsBody {
    #[serde(default)]
    pub index: EsIndexBlock,
}

#[derive(Debug, Default, Deserialize)]
pub struct EsIndexBlock {
    #[serde(default)]
    pub number_of_shards: Option<Value>,
    #[serde(default)]
    pub number_of_replicas: Option<Value>,
}

/// Elasticsearch reports counts as strings ("1"); anything missing,
/// unparseable, negative or out of range reads as `None`.
fn lenient_count(value: Option<&Value>) -> Option<u32> {
    match value {
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        _ => None,
    }
}

impl IndexSettings {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            shards: Some(1),
            replicas: Some(1),
            mappings: Mappings::default(),
            aliases: Value::Object(Map::new()),
        }
    }

    pub fn with_field(mut self, name: &str, field_type: &str) -> Self {
        self.mappings
            .properties
            .insert(name.to_string(), FieldMapping::of_type(field_type));
        self
    }

    pub fn from_es(index: impl Into<String>, body: EsIndexBody) -> Self {
        Self {
            index: index.into(),
            shards: lenient_count(body.settings.index.number_of_shards.as_ref()),
            replicas: lenient_count(body.settings.index.number_of_replicas.as_ref()),
            mappings: body.mappings,
            aliases: body.aliases,
        }
    }

    /// Decode a full `GET /{pattern}` response, one entry per concrete index,
    /// ordered by name.
    pub fn from_es_response(response: HashMap<String, EsIndexBody>) -> Vec<Self> {
        let mut settings: Vec<Self> = response
            .into_iter()
            .map(|(index, body)| Self::from_es(index, body))
            .collect();
        settings.sort_by(|a, b| a.index.cmp(&b.index));
        settings
    }

    /// True iff the mappings carry a `timestamp` field of type `date`
    pub fn has_date_timestamp(&self) -> bool {
        has_date_timestamp(self)
    }

    /// Body for `PUT /{index}`. Unknown counts are left to the destination's defaults.
    pub fn create_body(&self) -> Value {
        let mut index = Map::new();
        if let Some(shards) = self.shards {
            index.insert("number_of_shards".to_string(), json!(shards));
        }
        if let Some(replicas) = self.replicas {
            index.insert("number_of_replicas".to_string(), json!(replicas));
        }

        let mut body = Map::new();
        body.insert("settings".to_string(), json!({ "index": index }));
        body.insert(
            "mappings".to_string(),
            serde_json::to_value(&self.mappings).unwrap_or_else(|_| json!({})),
        );
        match &self.aliases {
            Value::Object(aliases) if !aliases.is_empty() => {
                body.insert("aliases".to_string(), self.aliases.clone());
            }
            _ => {}
        }

        Value::Object(body)
    }
}

/// Strategy predicate: the index can be walked with a point-in-time cursor
pub fn has_date_timestamp(settings: &IndexSettings) -> bool {
    settings
        .mappings
        .properties
        .get(TIMESTAMP_FIELD)
        .and_then(|m| m.field_type.as_deref())
        == Some("date")
}

/// Read-only view of source index settings
pub struct SettingsInspector<S> {
    store: Arc<S>,
}

impl<S: SourceStore> SettingsInspector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Settings of every concrete index matching `pattern`
    pub async fn get_settings(&self, pattern: &str) -> Result<Vec<IndexSettings>> {
        let settings = self.store.get_settings(pattern).await?;
        if settings.is_empty() {
            return Err(SyncError::IndexNotFound(pattern.to_string()));
        }

        debug!(
            pattern = %pattern,
            indices = settings.len(),
            "Fetched source index settings"
        );
        Ok(settings)
    }
}
