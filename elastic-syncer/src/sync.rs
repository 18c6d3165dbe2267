//! One replication run
//!
//! ```text
//! Provisioning ──▶ Replicating ──▶ Draining ──▶ Done
//!      │                │              │
//!      └────────────────┴──────────────┴──▶ Failed
//! ```
//!
//! Provisioning errors abort the run before any document is read. Traversal
//! errors fail only their own index; the run reports every failed index in
//! one aggregate error once the writer has drained.

use crate::client::{DestinationStore, SourceStore};
use crate::config::SyncConfig;
use crate::document::WriteOutcome;
use crate::error::{IndexFailure, Result, SyncError};
use crate::metrics::{record_document_written, record_index_completed};
use crate::progress::SyncProgress;
use crate::reader::{CursorReader, ExtractionRequest, Strategy};
use crate::settings::{IndexSettings, SettingsInspector};
use crate::writer::BulkWriter;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Provisioning,
    Replicating,
    Draining,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Provisioning => "provisioning",
            SyncPhase::Replicating => "replicating",
            SyncPhase::Draining => "draining",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to one index
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub index: String,
    pub strategy: Strategy,
    /// The destination index was created by this run
    pub created: bool,
    pub documents_read: u64,
    pub elapsed: Duration,
}

/// Summary of a run that did not fail
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub indices: Vec<IndexReport>,
    pub documents_read: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
    /// The run stopped early on cancellation
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Drives a replication run from a source to a destination cluster
pub struct Syncer<S, D> {
    config: SyncConfig,
    source: Arc<S>,
    destination: Arc<D>,
    progress: Arc<SyncProgress>,
    phase: watch::Sender<SyncPhase>,
}

impl<S: SourceStore, D: DestinationStore> Syncer<S, D> {
    pub fn new(config: SyncConfig, source: Arc<S>, destination: Arc<D>) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            config,
            source,
            destination,
            progress: Arc::new(SyncProgress::hidden()),
            phase,
        }
    }

    pub fn with_progress(mut self, progress: Arc<SyncProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn progress(&self) -> &Arc<SyncProgress> {
        &self.progress
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Follow phase transitions
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(phase = %phase, "Sync phase");
        self.phase.send_replace(phase);
    }

    fn fail(&self, error: SyncError) -> SyncError {
        self.set_phase(SyncPhase::Failed);
        error
    }

    /// Run one replication. Returns once every accepted write has reported
    /// its outcome, or the shutdown grace period after `cancel` has elapsed.
    pub async fn sync(&self, cancel: CancellationToken) -> Result<SyncReport> {
        let started = Instant::now();
        self.config.validate().map_err(|e| self.fail(e))?;

        info!(
            index = %self.config.index,
            from = ?self.config.window.from,
            to = ?self.config.window.to,
            limit = self.config.limit,
            "Starting sync"
        );

        let writer = Arc::new(BulkWriter::new(
            self.destination.clone(),
            self.config.bulk.clone(),
        ));

        self.set_phase(SyncPhase::Provisioning);
        let provisioned = match self.provision(&writer).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                error!(index = %self.config.index, error = %e, "Provisioning failed");
                let _ = writer.close().await;
                return Err(self.fail(e));
            }
        };

        self.set_phase(SyncPhase::Replicating);
        let (mut reports, failures) = self.replicate(provisioned, &writer, &cancel).await;

        self.set_phase(SyncPhase::Draining);
        let cancelled = cancel.is_cancelled();
        let drained = if cancelled {
            self.drain_cancelled(&writer).await;
            Ok(())
        } else {
            self.drain(&writer).await
        };

        self.progress.finish();
        if !failures.is_empty() {
            let err = SyncError::Replication { failures };
            error!(error = %err, "Sync finished with failures");
            return Err(self.fail(err));
        }
        drained.map_err(|e| self.fail(e))?;

        reports.sort_by(|a, b| a.index.cmp(&b.index));
        let report = SyncReport {
            indices: reports,
            documents_read: self.progress.read(),
            documents_written: self.progress.written(),
            documents_failed: self.progress.failed(),
            cancelled,
            elapsed: started.elapsed(),
        };
        info!(
            indices = report.indices.len(),
            read = report.documents_read,
            written = report.documents_written,
            failed = report.documents_failed,
            cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Sync finished"
        );
        self.set_phase(SyncPhase::Done);
        Ok(report)
    }

    /// Fetch source settings and make sure every destination index exists
    async fn provision(&self, writer: &BulkWriter<D>) -> Result<Vec<(IndexSettings, bool)>> {
        let inspector = SettingsInspector::new(self.source.clone());
        let settings = inspector.get_settings(&self.config.index).await?;

        let mut provisioned = Vec::with_capacity(settings.len());
        for index in settings {
            let created = writer.ensure_index(&index).await?;
            provisioned.push((index, created));
        }
        Ok(provisioned)
    }

    /// One traversal task per index; collects per-index results
    async fn replicate(
        &self,
        provisioned: Vec<(IndexSettings, bool)>,
        writer: &Arc<BulkWriter<D>>,
        cancel: &CancellationToken,
    ) -> (Vec<IndexReport>, Vec<IndexFailure>) {
        let reader = Arc::new(CursorReader::new(
            self.source.clone(),
            self.config.reader.clone(),
        ));
        let delivery = Arc::new(Semaphore::new(self.config.delivery_concurrency.max(1)));

        let mut tasks = JoinSet::new();
        let mut indices = HashMap::new();
        for (settings, created) in provisioned {
            let task = IndexTask {
                reader: reader.clone(),
                writer: writer.clone(),
                delivery: delivery.clone(),
                progress: self.progress.clone(),
                request: self.config.extraction_request(&settings.index),
                strategy: Strategy::for_settings(&settings),
                created,
                cancel: cancel.clone(),
            };
            let index = settings.index.clone();
            let handle = tasks.spawn(async move {
                let index = task.request.index.clone();
                (index, task.run().await)
            });
            indices.insert(handle.id(), index);
        }

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(report))) => {
                    record_index_completed(&index, true);
                    reports.push(report);
                }
                Ok((index, Err(error))) => {
                    error!(index = %index, error = %error, "Index replication failed");
                    record_index_completed(&index, false);
                    failures.push(IndexFailure { index, error });
                }
                Err(e) => {
                    let index = indices
                        .remove(&e.id())
                        .unwrap_or_else(|| self.config.index.clone());
                    error!(index = %index, error = %e, "Index task panicked");
                    record_index_completed(&index, false);
                    failures.push(IndexFailure {
                        index,
                        error: SyncError::Task(e.to_string()),
                    });
                }
            }
        }
        (reports, failures)
    }

    /// Flush, wait for every outcome, then close. A flush that does not
    /// complete in time still closes the writer, bounded by the grace period.
    async fn drain(&self, writer: &BulkWriter<D>) -> Result<()> {
        if let Err(e) = writer.flush(self.config.flush_timeout()).await {
            error!(error = %e, pending = writer.in_flight(), "Final flush failed");
            let grace = self.config.shutdown_grace();
            if tokio::time::timeout(grace, writer.close()).await.is_err() {
                warn!(
                    pending = writer.in_flight(),
                    "Shutdown grace period elapsed, abandoning pending writes"
                );
            }
            return Err(e);
        }
        writer.wait().await;
        writer.close().await
    }

    /// Best-effort drain bounded by the shutdown grace period
    async fn drain_cancelled(&self, writer: &BulkWriter<D>) {
        let grace = self.config.shutdown_grace();
        info!(grace_ms = grace.as_millis() as u64, pending = writer.in_flight(), "Cancelled, draining writer");

        let drained = tokio::time::timeout(grace, async {
            if let Err(e) = writer.flush(grace).await {
                warn!(error = %e, "Flush during shutdown failed");
            }
            writer.wait().await;
        })
        .await;

        match drained {
            Ok(()) => {
                let _ = writer.close().await;
            }
            Err(_) => warn!(
                pending = writer.in_flight(),
                "Shutdown grace period elapsed, abandoning pending writes"
            ),
        }
    }
}

/// Traversal of one index, handing every document to the writer
struct IndexTask<S, D> {
    reader: Arc<CursorReader<S>>,
    writer: Arc<BulkWriter<D>>,
    delivery: Arc<Semaphore>,
    progress: Arc<SyncProgress>,
    request: ExtractionRequest,
    strategy: Strategy,
    created: bool,
    cancel: CancellationToken,
}

impl<S: SourceStore, D: DestinationStore> IndexTask<S, D> {
    async fn run(self) -> Result<IndexReport> {
        let started = Instant::now();
        let mut stream = self
            .reader
            .documents(self.request.clone(), self.strategy, self.cancel.clone());

        let mut deliveries = JoinSet::new();
        let mut read = 0u64;
        let mut failure = None;

        while let Some(next) = stream.next().await {
            let doc = match next {
                Ok(doc) => doc,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            read += 1;
            self.progress.inc_read();

            let Ok(permit) = self.delivery.clone().acquire_owned().await else {
                break;
            };
            let writer = self.writer.clone();
            let progress = self.progress.clone();
            deliveries.spawn(async move {
                let meta = doc.meta.clone();
                let accepted = writer
                    .write(doc, move |outcome| report_outcome(&progress, outcome))
                    .await;
                drop(permit);
                if let Err(e) = accepted {
                    debug!(document = %meta, error = %e, "Document not accepted by writer");
                }
            });

            while let Some(done) = deliveries.try_join_next() {
                if let Err(e) = done {
                    error!(error = %e, "Delivery task panicked");
                }
            }
        }
        drop(stream);

        while let Some(done) = deliveries.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Delivery task panicked");
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let elapsed = started.elapsed();
        info!(
            index = %self.request.index,
            strategy = %self.strategy,
            documents = read,
            elapsed_ms = elapsed.as_millis() as u64,
            "Index traversal complete"
        );
        Ok(IndexReport {
            index: self.request.index,
            strategy: self.strategy,
            created: self.created,
            documents_read: read,
            elapsed,
        })
    }
}

/// Outcome callbacks only observe: log, count, record
fn report_outcome(progress: &SyncProgress, outcome: WriteOutcome) {
    record_document_written(&outcome.meta.index, outcome.is_success());
    match outcome.error {
        None => {
            progress.inc_written();
            trace!(document = %outcome.meta, "Document written");
        }
        Some(reason) => {
            progress.inc_failed();
            let err = SyncError::WriteFailed {
                index: outcome.meta.index,
                id: outcome.meta.id,
                reason,
            };
            warn!(error = %err, "Document write failed");
        }
    }
}
