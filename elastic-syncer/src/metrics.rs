//! Replication metrics
//!
//! Recorded through the `metrics` facade; they are no-ops unless the host
//! process installs a recorder.
//! - Documents read per index and strategy
//! - Page fetch latency
//! - Documents written / failed per index
//! - Bulk request count, latency and retries
//! - Open point-in-time handles

use crate::reader::Strategy;
use std::time::Duration;

/// Record one page fetch and the documents it returned
pub fn record_page_fetch(index: &str, strategy: Strategy, documents: usize, duration: Duration) {
    metrics::counter!(
        "syncer_documents_read_total",
        "index" => index.to_string(),
        "strategy" => strategy.as_str(),
    )
    .increment(documents as u64);

    metrics::histogram!(
        "syncer_page_fetch_seconds",
        "strategy" => strategy.as_str(),
    )
    .record(duration.as_secs_f64());
}

/// Record the outcome of one document write
pub fn record_document_written(index: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "syncer_documents_written_total",
        "index" => index.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record one `_bulk` round trip
pub fn record_bulk_request(success: bool, duration: Duration) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!("syncer_bulk_requests_total", "status" => status).increment(1);
    metrics::histogram!("syncer_bulk_request_seconds").record(duration.as_secs_f64());
}

pub fn record_bulk_retry(error_type: &str) {
    metrics::counter!(
        "syncer_bulk_retries_total",
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

pub fn record_snapshot_opened() {
    metrics::gauge!("syncer_snapshots_open").increment(1.0);
}

pub fn record_snapshot_closed() {
    metrics::gauge!("syncer_snapshots_open").decrement(1.0);
}

/// Record a finished index traversal
pub fn record_index_completed(index: &str, success: bool) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "syncer_indices_total",
        "index" => index.to_string(),
        "status" => status,
    )
    .increment(1);
}
