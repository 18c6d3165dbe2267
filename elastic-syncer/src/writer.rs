//! Destination side of a run: provisions indices and writes documents
//! through a [`BulkIndexer`], tracking how many writes are still pending.

use crate::bulk::{BulkIndexer, BulkIndexerStats, BulkItem};
use crate::client::DestinationStore;
use crate::config::BulkConfig;
use crate::document::{Document, WriteOutcome};
use crate::error::Result;
use crate::settings::IndexSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Counter of writes whose outcome has not been reported yet.
///
/// Incremented before a document is queued; the guard decrements it after
/// the outcome callback has run.
#[derive(Debug, Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

/// Decrements the in-flight counter when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl InFlight {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn acquire(&self) -> InFlightGuard {
        self.count.send_modify(|n| *n += 1);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once the counter reaches zero
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes documents to the destination cluster
pub struct BulkWriter<D> {
    store: Arc<D>,
    indexer: BulkIndexer,
    in_flight: InFlight,
}

impl<D: DestinationStore> BulkWriter<D> {
    /// Must be called from within a Tokio runtime
    pub fn new(store: Arc<D>, config: BulkConfig) -> Self {
        let indexer = BulkIndexer::new(store.clone(), config);
        Self {
            store,
            indexer,
            in_flight: InFlight::new(),
        }
    }

    /// Make sure `settings.index` exists on the destination, creating it from
    /// the source settings if not. Returns whether it was created.
    pub async fn ensure_index(&self, settings: &IndexSettings) -> Result<bool> {
        if self.store.index_exists(&settings.index).await? {
            debug!(index = %settings.index, "Destination index exists");
            return Ok(false);
        }

        self.store.create_index(settings).await?;
        info!(
            index = %settings.index,
            shards = ?settings.shards,
            replicas = ?settings.replicas,
            "Created destination index"
        );
        Ok(true)
    }

    /// Queue `doc` for indexing under its own index and id.
    ///
    /// Returns once the document is accepted, before it is transmitted.
    /// `on_outcome` runs exactly once, on a background task, when the
    /// destination has acknowledged or rejected the document.
    pub async fn write<F>(&self, doc: Document, on_outcome: F) -> Result<()>
    where
        F: FnOnce(WriteOutcome) + Send + 'static,
    {
        let guard = self.in_flight.acquire();
        let item = BulkItem::new(doc.meta, doc.source, move |outcome| {
            on_outcome(outcome);
            drop(guard);
        });
        self.indexer.add(item).await
    }

    /// Transmit everything queued so far, bounded by `timeout`
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.indexer.flush(timeout).await
    }

    /// Resolve once every accepted write has reported its outcome
    pub async fn wait(&self) {
        self.in_flight.wait_idle().await;
    }

    /// Writes accepted but not yet reported
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    pub fn stats(&self) -> &BulkIndexerStats {
        self.indexer.stats()
    }

    /// Transmit what is left and stop the indexer
    pub async fn close(&self) -> Result<()> {
        self.indexer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_flight_guard() {
        let in_flight = InFlight::new();
        let a = in_flight.acquire();
        let b = in_flight.acquire();
        assert_eq!(in_flight.count(), 2);

        let waiter = {
            let in_flight = in_flight.clone();
            tokio::spawn(async move { in_flight.wait_idle().await })
        };

        drop(a);
        assert_eq!(in_flight.count(), 1);
        assert!(!waiter.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_when_nothing_pending() {
        let in_flight = InFlight::new();
        tokio::time::timeout(Duration::from_millis(100), in_flight.wait_idle())
            .await
            .unwrap();
    }
}
