//! In-memory source and destination stores for integration tests.
//!
//! `MemorySource` behaves like a single-node cluster: point-in-time handles
//! freeze a copy of the index, searches honour the range filter, the
//! `(timestamp desc, _id desc)` sort, `search_after` and `from`.
//! `MemoryDestination` upserts documents and can throttle or reject writes.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use elastic_syncer::client::{BulkItemStatus, BulkOperation};
use elastic_syncer::{
    DestinationStore, Document, DocumentMeta, IndexSettings, Result, SearchPage, SearchRequest,
    SnapshotId, SourceStore, SyncError,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Base timestamp for seeded documents (2023-11-14T22:13:20Z)
pub const BASE_TS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub id: String,
    /// Epoch millis of the `timestamp` field, if the document has one
    pub ts: Option<i64>,
    pub body: String,
}

impl StoredDoc {
    fn sort_key(&self) -> (i64, String) {
        (self.ts.unwrap_or(i64::MIN), self.id.clone())
    }
}

struct MemIndex {
    settings: IndexSettings,
    docs: Vec<StoredDoc>,
}

struct Pit {
    index: String,
    docs: Vec<StoredDoc>,
}

/// Settings of an index that supports cursor traversal
pub fn timestamped(index: &str) -> IndexSettings {
    IndexSettings::new(index)
        .with_field("timestamp", "date")
        .with_field("message", "text")
}

/// Settings of an index without a `timestamp` date field
pub fn untimestamped(index: &str) -> IndexSettings {
    IndexSettings::new(index).with_field("created", "date")
}

/// `count` documents `doc-0000..`, one millisecond apart
pub fn seeded_docs(count: usize) -> Vec<StoredDoc> {
    (0..count)
        .map(|i| StoredDoc {
            id: format!("doc-{:04}", i),
            ts: Some(BASE_TS + i as i64),
            body: json!({ "timestamp": BASE_TS + i as i64, "message": format!("event {}", i) })
                .to_string(),
        })
        .collect()
}

#[derive(Default)]
pub struct MemorySource {
    indices: Mutex<BTreeMap<String, MemIndex>>,
    pits: Mutex<HashMap<String, Pit>>,
    pit_seq: AtomicUsize,
    opened: AtomicUsize,
    closed: Mutex<Vec<String>>,
    searches: Mutex<Vec<SearchRequest>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    expire_after: Mutex<Option<usize>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_index(&self, settings: IndexSettings, docs: Vec<StoredDoc>) {
        self.indices.lock().insert(
            settings.index.clone(),
            MemIndex { settings, docs },
        );
    }

    /// Write to an index after traversal has started
    pub fn insert(&self, index: &str, doc: StoredDoc) {
        if let Some(idx) = self.indices.lock().get_mut(index) {
            idx.docs.push(doc);
        }
    }

    /// Cancel `token` once `searches` page fetches have been served
    pub fn cancel_after(&self, searches: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some((searches, token));
    }

    /// Every search on `index` fails with a 503
    pub fn fail_searches(&self, index: &str) {
        self.failing.lock().insert(index.to_string());
    }

    /// Searches against `index` panic, taking their task down with them
    pub fn panic_searches(&self, index: &str) {
        self.panicking.lock().insert(index.to_string());
    }

    /// Point-in-time searches fail as expired after `searches` successful ones
    pub fn expire_pits_after(&self, searches: usize) {
        *self.expire_after.lock() = Some(searches);
    }

    pub fn searches(&self) -> Vec<SearchRequest> {
        self.searches.lock().clone()
    }

    pub fn search_count(&self) -> usize {
        self.searches.lock().len()
    }

    pub fn opened_pits(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_pits(&self) -> Vec<String> {
        self.closed.lock().clone()
    }

    /// Point-in-time handles still held server-side
    pub fn open_pits(&self) -> usize {
        self.pits.lock().len()
    }

    fn matches(pattern: &str, index: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => index.starts_with(prefix),
            None => pattern == index,
        }
    }

    fn in_window(doc: &StoredDoc, request: &SearchRequest) -> bool {
        if request.from_time.is_none() && request.to_time.is_none() {
            return true;
        }
        let Some(ts) = doc.ts else {
            return false;
        };
        let after_from = request.from_time.map_or(true, |from| ts >= from.timestamp_millis());
        let before_to = request.to_time.map_or(true, |to| ts <= to.timestamp_millis());
        after_from && before_to
    }
}

fn sort_key_of(values: &[serde_json::Value]) -> Option<(i64, String)> {
    let ts = values.first()?.as_i64()?;
    let id = values.get(1)?.as_str()?.to_string();
    Some((ts, id))
}

#[async_trait]
impl SourceStore for MemorySource {
    async fn get_settings(&self, pattern: &str) -> Result<Vec<IndexSettings>> {
        let indices = self.indices.lock();
        let settings: Vec<IndexSettings> = indices
            .values()
            .filter(|idx| Self::matches(pattern, &idx.settings.index))
            .map(|idx| idx.settings.clone())
            .collect();

        if settings.is_empty() && !pattern.contains('*') {
            return Err(SyncError::IndexNotFound(pattern.to_string()));
        }
        Ok(settings)
    }

    async fn open_snapshot(&self, index: &str, _keep_alive: Duration) -> Result<SnapshotId> {
        let docs = match self.indices.lock().get(index) {
            Some(idx) => idx.docs.clone(),
            None => return Err(SyncError::IndexNotFound(index.to_string())),
        };

        let id = format!("pit-{}", self.pit_seq.fetch_add(1, Ordering::SeqCst));
        self.pits.lock().insert(
            id.clone(),
            Pit {
                index: index.to_string(),
                docs,
            },
        );
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SnapshotId(id))
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let served = {
            let mut searches = self.searches.lock();
            searches.push(request.clone());
            searches.len()
        };

        let panics = self.panicking.lock().contains(&request.index);
        if panics {
            panic!("search against {} blew up", request.index);
        }

        if self.failing.lock().contains(&request.index) {
            return Err(SyncError::SourceUnavailable {
                status: Some(503),
                reason: "search_phase_execution_exception: all shards failed".to_string(),
            });
        }

        let (docs, index, pit_id) = match &request.pit {
            Some(pit) => {
                if let Some(limit) = *self.expire_after.lock() {
                    if served > limit {
                        return Err(SyncError::SnapshotExpired(pit.id.clone()));
                    }
                }
                let mut pits = self.pits.lock();
                let Some(held) = pits.remove(&pit.id) else {
                    return Err(SyncError::SnapshotExpired(pit.id.clone()));
                };
                let docs = held.docs.clone();
                let index = held.index.clone();
                // Rotate the id the way a cluster may on every search
                let base = pit.id.split('.').next().unwrap_or(&pit.id).to_string();
                let refreshed = format!("{}.{}", base, served);
                pits.insert(refreshed.clone(), held);
                (docs, index, Some(refreshed))
            }
            None => match self.indices.lock().get(&request.index) {
                Some(idx) => (idx.docs.clone(), request.index.clone(), None),
                None => return Err(SyncError::IndexNotFound(request.index.clone())),
            },
        };

        let mut matching: Vec<StoredDoc> = docs
            .into_iter()
            .filter(|d| Self::in_window(d, request))
            .collect();
        matching.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        let total = matching.len() as u64;

        if let Some(after) = request.search_after.as_ref().and_then(|s| sort_key_of(s.values())) {
            matching.retain(|d| d.sort_key() < after);
        }

        let hits: Vec<Document> = matching
            .into_iter()
            .skip(request.offset.unwrap_or(0))
            .take(request.size)
            .map(|d| {
                let (ts, id) = d.sort_key();
                Document::new(index.clone(), d.id, d.body).with_sort(vec![json!(ts), json!(id)])
            })
            .collect();

        if let Some((after, token)) = self.cancel_after.lock().as_ref() {
            if served >= *after {
                token.cancel();
            }
        }

        Ok(SearchPage {
            hits,
            total: Some(total),
            pit_id,
        })
    }

    async fn close_snapshot(&self, id: &SnapshotId) -> Result<()> {
        match self.pits.lock().remove(id.as_str()) {
            Some(_) => {
                self.closed.lock().push(id.as_str().to_string());
                Ok(())
            }
            None => Err(SyncError::SnapshotNotFound(id.as_str().to_string())),
        }
    }
}

#[derive(Default)]
pub struct MemoryDestination {
    indices: Mutex<BTreeMap<String, IndexSettings>>,
    docs: Mutex<HashMap<DocumentMeta, Bytes>>,
    writes: Mutex<HashMap<DocumentMeta, usize>>,
    bulk_calls: AtomicUsize,
    create_calls: AtomicUsize,
    throttle: AtomicUsize,
    reject: Mutex<HashSet<String>>,
    fail_create: Mutex<Option<String>>,
    bulk_delay: Mutex<Duration>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(self, settings: IndexSettings) -> Self {
        self.indices.lock().insert(settings.index.clone(), settings);
        self
    }

    /// The next `requests` bulk calls are rejected with 429 for every item
    pub fn throttle_next(&self, requests: usize) {
        self.throttle.store(requests, Ordering::SeqCst);
    }

    /// Documents with this id fail with a mapping error
    pub fn reject_id(&self, id: &str) {
        self.reject.lock().insert(id.to_string());
    }

    /// Index creation fails with this reason
    pub fn fail_create(&self, reason: &str) {
        *self.fail_create.lock() = Some(reason.to_string());
    }

    pub fn delay_bulk(&self, delay: Duration) {
        *self.bulk_delay.lock() = delay;
    }

    pub fn index(&self, name: &str) -> Option<IndexSettings> {
        self.indices.lock().get(name).cloned()
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.docs.lock().keys().filter(|m| m.index == index).count()
    }

    pub fn doc(&self, index: &str, id: &str) -> Option<Bytes> {
        let meta = DocumentMeta {
            index: index.to_string(),
            id: id.to_string(),
        };
        self.docs.lock().get(&meta).cloned()
    }

    /// Successful writes per document
    pub fn writes(&self) -> HashMap<DocumentMeta, usize> {
        self.writes.lock().clone()
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinationStore for MemoryDestination {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.indices.lock().contains_key(index))
    }

    async fn create_index(&self, settings: &IndexSettings) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_create.lock().clone() {
            return Err(SyncError::IndexCreateConflict {
                index: settings.index.clone(),
                reason,
            });
        }
        self.indices
            .lock()
            .entry(settings.index.clone())
            .or_insert_with(|| settings.clone());
        Ok(())
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemStatus>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.bulk_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let throttled = self
            .throttle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Ok(operations
                .iter()
                .map(|_| BulkItemStatus::failed(429, "es_rejected_execution_exception: queue full"))
                .collect());
        }

        let reject = self.reject.lock().clone();
        let mut docs = self.docs.lock();
        let mut writes = self.writes.lock();
        Ok(operations
            .iter()
            .map(|op| {
                if reject.contains(&op.meta.id) {
                    return BulkItemStatus::failed(400, "mapper_parsing_exception: failed to parse");
                }
                let created = docs.insert(op.meta.clone(), op.source.clone()).is_none();
                *writes.entry(op.meta.clone()).or_default() += 1;
                BulkItemStatus::ok(if created { 201 } else { 200 })
            })
            .collect())
    }
}
