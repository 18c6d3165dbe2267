//! Documents as they travel from the source cursor to the bulk writer

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of a document: where it lives and under which `_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentMeta {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
}

impl fmt::Display for DocumentMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.id)
    }
}

/// Sort values returned with a hit, `[timestamp, _id]` for cursor traversal.
/// Empty when the page came from offset pagination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(pub Vec<Value>);

impl SortKey {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

/// One extracted document. The body is kept as the raw `_source` bytes and
/// is never interpreted by the engine.
#[derive(Debug, Clone)]
pub struct Document {
    pub meta: DocumentMeta,
    pub source: Bytes,
    pub sort: SortKey,
}

impl Document {
    pub fn new(index: impl Into<String>, id: impl Into<String>, source: impl Into<Bytes>) -> Self {
        Self {
            meta: DocumentMeta {
                index: index.into(),
                id: id.into(),
            },
            source: source.into(),
            sort: SortKey::default(),
        }
    }

    pub fn with_sort(mut self, sort: Vec<Value>) -> Self {
        self.sort = SortKey(sort);
        self
    }

    pub fn index(&self) -> &str {
        &self.meta.index
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Decode the body for callers that need to look inside it
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.source)
    }
}

/// Result of writing one document to the destination
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub meta: DocumentMeta,
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn success(meta: DocumentMeta) -> Self {
        Self { meta, error: None }
    }

    pub fn failure(meta: DocumentMeta, error: impl Into<String>) -> Self {
        Self {
            meta,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
