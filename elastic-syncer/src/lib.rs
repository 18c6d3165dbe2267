//! elastic-syncer: replicate the documents of one or more Elasticsearch indices
//! from a source cluster to a destination cluster.
//!
//! A run provisions missing destination indices with the source's settings,
//! walks every matching source document exactly once (point-in-time cursor when
//! the index has a date-typed `timestamp` field, offset pagination otherwise) and
//! hands each document to a batching bulk writer.
//!
//! ```text
//! Syncer ──► SettingsInspector ──► BulkWriter::ensure_index
//!    │
//!    └──► CursorReader (one task per index) ──► BulkWriter::write ──► BulkIndexer ──► _bulk
//! ```

pub mod bulk;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod metrics;
pub mod progress;
pub mod reader;
pub mod settings;
pub mod sync;
pub mod writer;

pub use bulk::{BulkIndexer, BulkIndexerStats, BulkItem};
pub use client::{DestinationStore, EsClient, SearchPage, SearchRequest, Side, SnapshotId, SourceStore};
pub use config::{BulkConfig, ClusterConfig, ReaderConfig, RetryConfig, SyncConfig, TimeWindow};
pub use document::{Document, DocumentMeta, SortKey, WriteOutcome};
pub use error::{IndexFailure, Result, SyncError};
pub use progress::SyncProgress;
pub use reader::{CursorReader, ExtractionRequest, Strategy};
pub use settings::{IndexSettings, SettingsInspector};
pub use sync::{IndexReport, SyncPhase, SyncReport, Syncer};
pub use writer::{BulkWriter, InFlight};
