//! Document-store collaborators
//!
//! The engine only talks to a cluster through [`SourceStore`] and
//! [`DestinationStore`]. [`EsClient`] implements both over the Elasticsearch
//! REST API; tests plug in in-memory stores.

pub mod http;

pub use http::EsClient;
pub use crate::reader::query::SearchRequest;

use crate::document::{Document, DocumentMeta};
use crate::error::Result;
use crate::settings::IndexSettings;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Which end of the replication a client serves. Decides whether transport
/// failures surface as source or destination unavailability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
}

/// Server-side point-in-time handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // PIT ids are long base64 blobs
        if self.0.chars().count() > 16 {
            write!(f, "{}...", self.0.chars().take(16).collect::<String>())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// One page of search results
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub hits: Vec<Document>,
    /// Reported total hits, when the store tracks it
    pub total: Option<u64>,
    /// Refreshed point-in-time id; later pages must use it
    pub pit_id: Option<String>,
}

/// Read side of a cluster
#[async_trait]
pub trait SourceStore: Send + Sync + 'static {
    /// Settings of every concrete index matching `pattern`
    async fn get_settings(&self, pattern: &str) -> Result<Vec<IndexSettings>>;

    /// Open a point-in-time on `index`, leased for `keep_alive`
    async fn open_snapshot(&self, index: &str, keep_alive: Duration) -> Result<SnapshotId>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage>;

    /// Release a point-in-time. An unknown id yields `SnapshotNotFound`,
    /// which callers treat as already released.
    async fn close_snapshot(&self, id: &SnapshotId) -> Result<()>;
}

/// Write side of a cluster
#[async_trait]
pub trait DestinationStore: Send + Sync + 'static {
    async fn index_exists(&self, index: &str) -> Result<bool>;

    /// Create an index. An index that already exists is not an error.
    async fn create_index(&self, settings: &IndexSettings) -> Result<()>;

    /// Transmit one `_bulk` request. Returns one status per operation, in order.
    async fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemStatus>>;
}

/// A single `index` action of a `_bulk` request
#[derive(Debug, Clone)]
pub struct BulkOperation {
    pub meta: DocumentMeta,
    pub source: Bytes,
    action: Bytes,
}

impl BulkOperation {
    pub fn new(meta: DocumentMeta, source: Bytes) -> Self {
        let action = json!({ "index": { "_index": meta.index, "_id": meta.id } }).to_string();
        Self {
            meta,
            source: single_line(source),
            action: Bytes::from(action),
        }
    }

    /// Size of this operation on the wire, both lines included
    pub fn encoded_len(&self) -> usize {
        self.action.len() + self.source.len() + 2
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.action);
        buf.push(b'\n');
        buf.extend_from_slice(&self.source);
        buf.push(b'\n');
    }
}

/// NDJSON needs every document on one line
fn single_line(source: Bytes) -> Bytes {
    if !source.iter().any(|b| *b == b'\n' || *b == b'\r') {
        return source;
    }
    match serde_json::from_slice::<serde_json::Value>(&source) {
        Ok(value) => Bytes::from(value.to_string()),
        Err(_) => source,
    }
}

/// Encode a `_bulk` request body
pub fn encode_bulk(operations: &[BulkOperation]) -> Vec<u8> {
    let len = operations.iter().map(BulkOperation::encoded_len).sum();
    let mut buf = Vec::with_capacity(len);
    for op in operations {
        op.encode_into(&mut buf);
    }
    buf
}

/// Per-operation result of a `_bulk` request
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemStatus {
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemStatus {
    pub fn ok(status: u16) -> Self {
        Self { status, error: None }
    }

    pub fn failed(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}
