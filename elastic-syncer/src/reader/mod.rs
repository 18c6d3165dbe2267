//! Cursor-based extraction of every document of one index
//!
//! Two traversal strategies, picked once per index before the first fetch:
//!
//! - [`Strategy::Pinned`]: open a point-in-time, then page with `search_after`
//!   on `(timestamp desc, _id desc)`. Stable under concurrent writes.
//! - [`Strategy::Paginated`]: `from`/`size` offsets over the same query. No
//!   snapshot is held, so a refresh between pages can skip or repeat
//!   documents. Used when the index has no date-typed `timestamp` field.
//!
//! Traversal is lazy: [`CursorReader::documents`] returns a stream, and the
//! next page is only fetched once the previous one has been consumed.
//! Cancellation is checked between page fetches, never mid-page.

pub mod query;

use crate::client::{SnapshotId, SourceStore};
use crate::config::ReaderConfig;
use crate::document::Document;
use crate::error::{Result, SyncError};
use crate::metrics::{record_page_fetch, record_snapshot_closed, record_snapshot_opened};
use crate::settings::IndexSettings;
use chrono::{DateTime, Utc};
use futures::Stream;
use query::{PitRef, SearchRequest};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type DocumentStream<'a> = Pin<Box<dyn Stream<Item = Result<Document>> + Send + 'a>>;

/// Traversal of one index, derived from the run-level window
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionRequest {
    pub index: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Maximum documents delivered, 0 = unbounded
    pub limit: usize,
}

impl ExtractionRequest {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            from: None,
            to: None,
            limit: 0,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Documents still allowed after `delivered`, `None` when unbounded
    fn remaining(&self, delivered: usize) -> Option<usize> {
        if self.limit == 0 {
            None
        } else {
            Some(self.limit.saturating_sub(delivered))
        }
    }

    fn search(&self, size: usize) -> SearchRequest {
        let mut req = SearchRequest::new(self.index.clone(), size);
        req.from_time = self.from;
        req.to_time = self.to;
        req
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Point-in-time + `search_after`
    Pinned,
    /// `from`/`size`, not snapshot-isolated
    Paginated,
}

impl Strategy {
    pub fn for_settings(settings: &IndexSettings) -> Self {
        if settings.has_date_timestamp() {
            Strategy::Pinned
        } else {
            Strategy::Paginated
        }
    }

    /// Whether results stay consistent while the index is written to
    pub fn is_consistent(&self) -> bool {
        matches!(self, Strategy::Pinned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Pinned => "pinned",
            Strategy::Paginated => "paginated",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open point-in-time, owned by exactly one traversal.
///
/// `release` closes it; a lease dropped without release (the consumer
/// abandoned the stream) closes it from a background task.
struct SnapshotLease<S: SourceStore> {
    store: Arc<S>,
    id: Option<SnapshotId>,
    index: String,
}

impl<S: SourceStore> SnapshotLease<S> {
    async fn open(store: Arc<S>, index: &str, config: &ReaderConfig) -> Result<Self> {
        let id = store.open_snapshot(index, config.keep_alive()).await?;
        record_snapshot_opened();
        debug!(index = %index, pit = %id, "Opened point-in-time");
        Ok(Self {
            store,
            id: Some(id),
            index: index.to_string(),
        })
    }

    fn pit(&self, config: &ReaderConfig) -> Option<PitRef> {
        self.id.as_ref().map(|id| PitRef {
            id: id.0.clone(),
            keep_alive: config.keep_alive(),
        })
    }

    /// Adopt a refreshed id returned by a search
    fn refresh(&mut self, pit_id: Option<String>) {
        if let (Some(new_id), Some(current)) = (pit_id, self.id.as_mut()) {
            if current.0 != new_id {
                current.0 = new_id;
            }
        }
    }

    async fn release(mut self) -> Result<()> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        close_snapshot(self.store.as_ref(), &self.index, &id).await
    }
}

impl<S: SourceStore> Drop for SnapshotLease<S> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let store = self.store.clone();
        let index = std::mem::take(&mut self.index);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = close_snapshot(store.as_ref(), &index, &id).await {
                        warn!(index = %index, error = %e, "Failed to release abandoned point-in-time");
                    }
                });
            }
            Err(_) => {
                warn!(index = %index, pit = %id, "Point-in-time leaked, no runtime to release it");
            }
        }
    }
}

async fn close_snapshot<S: SourceStore>(store: &S, index: &str, id: &SnapshotId) -> Result<()> {
    let result = match store.close_snapshot(id).await {
        Ok(()) => Ok(()),
        Err(SyncError::SnapshotNotFound(_)) => {
            debug!(index = %index, pit = %id, "Point-in-time already gone");
            Ok(())
        }
        Err(e) => Err(e),
    };
    record_snapshot_closed();
    debug!(index = %index, pit = %id, "Released point-in-time");
    result
}

/// Lazily enumerates the documents of one index
pub struct CursorReader<S> {
    store: Arc<S>,
    config: ReaderConfig,
}

impl<S: SourceStore> CursorReader<S> {
    pub fn new(store: Arc<S>, config: ReaderConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Stream every document of `request.index` inside the window, at most
    /// `request.limit` of them. The stream ends early without error once
    /// `cancel` fires. A fetch error is yielded once and ends the stream.
    pub fn documents(
        &self,
        request: ExtractionRequest,
        strategy: Strategy,
        cancel: CancellationToken,
    ) -> DocumentStream<'static> {
        let store = self.store.clone();
        let config = self.config.clone();
        match strategy {
            Strategy::Pinned => Box::pin(pinned(store, config, request, cancel)),
            Strategy::Paginated => {
                warn!(
                    index = %request.index,
                    "Index has no date-typed 'timestamp' field, using offset pagination; \
                     documents written during the copy may be skipped or repeated"
                );
                Box::pin(paginated(store, config, request, cancel))
            }
        }
    }
}

fn pinned<S: SourceStore>(
    store: Arc<S>,
    config: ReaderConfig,
    request: ExtractionRequest,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Document>> + Send + 'static {
    async_stream::try_stream! {
        if !cancel.is_cancelled() && request.remaining(0) != Some(0) {
            let mut lease = SnapshotLease::open(store.clone(), &request.index, &config).await?;
            info!(index = %request.index, strategy = "pinned", "Reading index");

            let mut delivered = 0usize;
            let mut pages = 0usize;
            let mut search_after = None;
            let mut failure = None;

            loop {
                if cancel.is_cancelled() {
                    info!(index = %request.index, delivered, "Traversal cancelled");
                    break;
                }

                let size = match request.remaining(delivered) {
                    Some(0) => break,
                    Some(left) => left.min(config.page_size),
                    None => config.page_size,
                };

                let mut search = request.search(size);
                search.pit = lease.pit(&config);
                search.search_after = search_after.take();

                let started = Instant::now();
                let page = match store.search(&search).await {
                    Ok(page) => page,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                pages += 1;
                record_page_fetch(&request.index, Strategy::Pinned, page.hits.len(), started.elapsed());
                lease.refresh(page.pit_id);

                if page.hits.is_empty() {
                    break;
                }

                let mut hits = page.hits;
                hits.truncate(size);
                search_after = hits.last().map(|d| d.sort.clone()).filter(|s| !s.is_empty());

                for doc in hits {
                    delivered += 1;
                    yield doc;
                }

                if search_after.is_none() {
                    // Nothing to resume from
                    warn!(index = %request.index, "Hit without sort values, stopping traversal");
                    break;
                }
            }

            let released = lease.release().await;
            if let Some(e) = failure {
                if let Err(close_err) = released {
                    warn!(index = %request.index, error = %close_err, "Failed to release point-in-time");
                }
                Err::<(), SyncError>(e)?;
            } else {
                released?;
                debug!(index = %request.index, pages, delivered, "Pinned traversal finished");
            }
        }
    }
}

fn paginated<S: SourceStore>(
    store: Arc<S>,
    config: ReaderConfig,
    request: ExtractionRequest,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Document>> + Send + 'static {
    async_stream::try_stream! {
        info!(index = %request.index, strategy = "paginated", "Reading index");

        let mut delivered = 0usize;
        let mut offset = 0usize;
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                info!(index = %request.index, delivered, "Traversal cancelled");
                break;
            }

            let size = match request.remaining(delivered) {
                Some(0) => break,
                Some(left) => left.min(config.page_size),
                None => config.page_size,
            };

            let mut search = request.search(size);
            search.offset = Some(offset);

            let started = Instant::now();
            let page = store.search(&search).await?;
            pages += 1;
            record_page_fetch(&request.index, Strategy::Paginated, page.hits.len(), started.elapsed());

            if page.total == Some(0) {
                break;
            }

            let returned = page.hits.len();
            for doc in page.hits.into_iter().take(size) {
                delivered += 1;
                yield doc;
            }

            if returned < size {
                break;
            }
            offset += size;
        }

        debug!(index = %request.index, pages, delivered, "Paginated traversal finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        let pinned = IndexSettings::new("events").with_field("timestamp", "date");
        assert_eq!(Strategy::for_settings(&pinned), Strategy::Pinned);
        assert!(Strategy::for_settings(&pinned).is_consistent());

        let paginated = IndexSettings::new("orders").with_field("created", "date");
        assert_eq!(Strategy::for_settings(&paginated), Strategy::Paginated);
        assert!(!Strategy::Paginated.is_consistent());
    }

    #[test]
    fn test_remaining() {
        let unbounded = ExtractionRequest::new("logs");
        assert_eq!(unbounded.remaining(1_000_000), None);

        let bounded = ExtractionRequest::new("logs").with_limit(10);
        assert_eq!(bounded.remaining(3), Some(7));
        assert_eq!(bounded.remaining(12), Some(0));
    }
}
