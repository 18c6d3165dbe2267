//! Batching `_bulk` indexer
//!
//! ```text
//! add() ──▶ mpsc ──▶ dispatcher ──┬──▶ buffer (flush on bytes / interval / Flush)
//!                                 │
//!                                 └──▶ worker task per batch (≤ workers at once)
//!                                          │
//!                                          ├──▶ retry 429/502/503/504 with backoff
//!                                          └──▶ per-item callback
//! ```
//!
//! Every item handed to [`BulkIndexer::add`] gets its callback invoked exactly
//! once, with either a success or a failure.

use crate::client::{BulkItemStatus, BulkOperation, DestinationStore};
use crate::config::{BulkConfig, RetryConfig};
use crate::document::{DocumentMeta, WriteOutcome};
use crate::error::{Result, SyncError};
use crate::metrics::{record_bulk_request, record_bulk_retry};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

pub type WriteCallback = Box<dyn FnOnce(WriteOutcome) + Send + 'static>;

/// One document queued for indexing, plus who to tell about the result
pub struct BulkItem {
    pub operation: BulkOperation,
    callback: WriteCallback,
}

impl BulkItem {
    pub fn new(
        meta: DocumentMeta,
        source: Bytes,
        callback: impl FnOnce(WriteOutcome) + Send + 'static,
    ) -> Self {
        Self {
            operation: BulkOperation::new(meta, source),
            callback: Box::new(callback),
        }
    }

    fn complete(self, outcome: WriteOutcome) {
        (self.callback)(outcome);
    }

    fn fail(self, reason: impl Into<String>) {
        let meta = self.operation.meta.clone();
        self.complete(WriteOutcome::failure(meta, reason));
    }

    /// Report a failure from a detached task, off the caller's context
    fn fail_detached(self, reason: String) {
        tokio::spawn(async move { self.fail(reason) });
    }
}

impl std::fmt::Debug for BulkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkItem")
            .field("meta", &self.operation.meta)
            .field("bytes", &self.operation.encoded_len())
            .finish()
    }
}

enum Command {
    Add(BulkItem),
    Flush(oneshot::Sender<()>),
}

/// Running totals, shared between the indexer and its workers
#[derive(Debug, Default)]
pub struct BulkIndexerStats {
    added: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    requests: AtomicU64,
    retries: AtomicU64,
}

impl BulkIndexerStats {
    /// Items accepted by `add`
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    /// Items indexed successfully
    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// `_bulk` round trips, retries included
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Asynchronous, batching writer in front of a [`DestinationStore`]
pub struct BulkIndexer {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<BulkIndexerStats>,
}

impl BulkIndexer {
    /// Start the dispatcher. Must be called from within a Tokio runtime.
    pub fn new<D: DestinationStore>(store: Arc<D>, config: BulkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(BulkIndexerStats::default());
        let dispatcher = tokio::spawn(dispatch_loop(store, config, rx, stats.clone()));

        Self {
            sender: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            stats,
        }
    }

    pub fn stats(&self) -> &BulkIndexerStats {
        &self.stats
    }

    /// Queue one item. Waits while the queue is full. On a closed indexer the
    /// item's callback receives a failure and `WriterClosed` is returned.
    pub async fn add(&self, item: BulkItem) -> Result<()> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            item.fail_detached(SyncError::WriterClosed.to_string());
            return Err(SyncError::WriterClosed);
        };

        match sender.send(Command::Add(item)).await {
            Ok(()) => {
                self.stats.added.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(command)) => {
                if let Command::Add(item) = command {
                    item.fail_detached(SyncError::WriterClosed.to_string());
                }
                Err(SyncError::WriterClosed)
            }
        }
    }

    /// Transmit everything buffered so far and wait until every transmission
    /// in flight has reported back, or `timeout` elapses.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Err(SyncError::WriterClosed);
        };

        let (done_tx, done_rx) = oneshot::channel();
        let wait = async {
            sender
                .send(Command::Flush(done_tx))
                .await
                .map_err(|_| SyncError::WriterClosed)?;
            done_rx.await.map_err(|_| SyncError::WriterClosed)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::FlushTimeout(timeout)),
        }
    }

    /// Stop accepting items, transmit what is left and wait for the
    /// dispatcher to exit. Idempotent.
    pub async fn close(&self) -> Result<()> {
        drop(self.sender.lock().take());
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Bulk dispatcher panicked");
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Items waiting for the next transmission
#[derive(Default)]
struct Buffer {
    items: Vec<BulkItem>,
    bytes: usize,
}

impl Buffer {
    fn push(&mut self, item: BulkItem) {
        self.bytes += item.operation.encoded_len();
        self.items.push(item);
    }

    fn take(&mut self) -> Vec<BulkItem> {
        self.bytes = 0;
        std::mem::take(&mut self.items)
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

async fn dispatch_loop<D: DestinationStore>(
    store: Arc<D>,
    config: BulkConfig,
    mut rx: mpsc::Receiver<Command>,
    stats: Arc<BulkIndexerStats>,
) {
    let workers = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut buffer = Buffer::default();

    let mut ticker = tokio::time::interval(config.flush_interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Add(item)) => {
                    let len = item.operation.encoded_len();
                    if !buffer.is_empty() && buffer.bytes + len > config.flush_bytes {
                        transmit(&store, &config.retry, &workers, &mut in_flight, &stats, buffer.take()).await;
                    }
                    buffer.push(item);
                    if buffer.bytes >= config.flush_bytes {
                        transmit(&store, &config.retry, &workers, &mut in_flight, &stats, buffer.take()).await;
                    }
                }
                Some(Command::Flush(done)) => {
                    if !buffer.is_empty() {
                        transmit(&store, &config.retry, &workers, &mut in_flight, &stats, buffer.take()).await;
                    }
                    join_all(&mut in_flight).await;
                    let _ = done.send(());
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    debug!(items = buffer.items.len(), bytes = buffer.bytes, "Flush interval elapsed");
                    transmit(&store, &config.retry, &workers, &mut in_flight, &stats, buffer.take()).await;
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Bulk worker panicked");
                }
            }
        }
    }

    if !buffer.is_empty() {
        transmit(&store, &config.retry, &workers, &mut in_flight, &stats, buffer.take()).await;
    }
    join_all(&mut in_flight).await;
    debug!(
        flushed = stats.flushed(),
        failed = stats.failed(),
        requests = stats.requests(),
        "Bulk dispatcher stopped"
    );
}

async fn join_all(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Bulk worker panicked");
        }
    }
}

/// Hand a batch to a worker, waiting for a free worker slot first
async fn transmit<D: DestinationStore>(
    store: &Arc<D>,
    retry: &RetryConfig,
    workers: &Arc<Semaphore>,
    in_flight: &mut JoinSet<()>,
    stats: &Arc<BulkIndexerStats>,
    batch: Vec<BulkItem>,
) {
    let permit: Option<OwnedSemaphorePermit> = workers.clone().acquire_owned().await.ok();
    let store = store.clone();
    let retry = retry.clone();
    let stats = stats.clone();

    in_flight.spawn(async move {
        send_batch(store.as_ref(), &retry, &stats, batch).await;
        drop(permit);
    });
}

/// Send one batch, retrying transient failures, and report every item
async fn send_batch<D: DestinationStore>(
    store: &D,
    retry: &RetryConfig,
    stats: &BulkIndexerStats,
    batch: Vec<BulkItem>,
) {
    let operations: Vec<BulkOperation> = batch.iter().map(|i| i.operation.clone()).collect();
    let mut outcomes: Vec<Option<std::result::Result<(), String>>> = vec![None; batch.len()];
    let mut pending: Vec<usize> = (0..batch.len()).collect();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    while !pending.is_empty() {
        attempt += 1;
        let last_attempt = attempt >= max_attempts;
        let request: Vec<BulkOperation> = pending.iter().map(|&i| operations[i].clone()).collect();

        let started = Instant::now();
        let result = store.bulk(&request).await;
        stats.requests.fetch_add(1, Ordering::Relaxed);
        record_bulk_request(result.is_ok(), started.elapsed());

        let retry_reason = match result {
            Ok(statuses) => {
                let mut again = Vec::new();
                for (pos, &i) in pending.iter().enumerate() {
                    match statuses.get(pos) {
                        Some(status) if status.is_success() => outcomes[i] = Some(Ok(())),
                        Some(status) if !last_attempt && retry.retry_on_status.contains(&status.status) => {
                            again.push(i)
                        }
                        Some(status) => outcomes[i] = Some(Err(item_reason(status))),
                        None => outcomes[i] = Some(Err("missing from bulk response".to_string())),
                    }
                }
                pending = again;
                "item_status"
            }
            Err(e) if !last_attempt && retry.should_retry(&e) => {
                warn!(attempt, items = pending.len(), error = %e, "Bulk request failed, retrying");
                e.error_type()
            }
            Err(e) => {
                warn!(attempt, items = pending.len(), error = %e, "Bulk request failed");
                let reason = e.to_string();
                for &i in &pending {
                    outcomes[i] = Some(Err(reason.clone()));
                }
                pending.clear();
                "none"
            }
        };

        if !pending.is_empty() {
            let delay = retry.delay_for_attempt(attempt);
            debug!(attempt, items = pending.len(), delay_ms = delay.as_millis() as u64, "Retrying bulk items");
            stats.retries.fetch_add(1, Ordering::Relaxed);
            record_bulk_retry(retry_reason);
            tokio::time::sleep(delay).await;
        }
    }

    for (item, outcome) in batch.into_iter().zip(outcomes) {
        match outcome {
            Some(Ok(())) => {
                stats.flushed.fetch_add(1, Ordering::Relaxed);
                let meta = item.operation.meta.clone();
                item.complete(WriteOutcome::success(meta));
            }
            Some(Err(reason)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                item.fail(reason);
            }
            None => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                item.fail("not transmitted");
            }
        }
    }
}

fn item_reason(status: &BulkItemStatus) -> String {
    match &status.error {
        Some(error) => format!("status {}: {}", status.status, error),
        None => format!("status {}", status.status),
    }
}
