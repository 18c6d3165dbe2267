//! Run configuration
//!
//! Every knob has a named default; a config file (TOML) only needs the fields
//! it wants to change. The CLI builds the same struct from flags.

use crate::error::{Result, SyncError, RETRYABLE_STATUS};
use crate::reader::ExtractionRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration of one replication run
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Index name or pattern (`logs-*`) to replicate
    #[serde(default)]
    pub index: String,

    #[serde(default)]
    pub source: ClusterConfig,

    #[serde(default)]
    pub destination: ClusterConfig,

    /// Time window applied to the `timestamp` field
    #[serde(default)]
    pub window: TimeWindow,

    /// Maximum documents copied per index, 0 = unbounded
    #[serde(default)]
    pub limit: usize,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    /// Maximum documents handed to the writer concurrently across all indices
    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,

    /// Deadline for the final flush of a completed run, in milliseconds
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,

    /// Grace period for draining the writer after cancellation, in milliseconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_delivery_concurrency() -> usize {
    256
}

fn default_flush_timeout() -> u64 {
    30_000
}

fn default_shutdown_grace() -> u64 {
    30_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            index: String::new(),
            source: ClusterConfig::default(),
            destination: ClusterConfig::default(),
            window: TimeWindow::default(),
            limit: 0,
            reader: ReaderConfig::default(),
            bulk: BulkConfig::default(),
            delivery_concurrency: default_delivery_concurrency(),
            flush_timeout_ms: default_flush_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl SyncConfig {
    /// Load a config file; missing sections fall back to defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reject configurations that cannot start a run. No I/O happens here.
    pub fn validate(&self) -> Result<()> {
        if self.index.trim().is_empty() {
            return Err(SyncError::Config("no index specified".to_string()));
        }
        if self.source.address.is_empty() {
            return Err(SyncError::Config("no source address specified".to_string()));
        }
        if self.destination.address.is_empty() {
            return Err(SyncError::Config(
                "no destination address specified".to_string(),
            ));
        }
        if let (Some(from), Some(to)) = (self.window.from, self.window.to) {
            if from > to {
                return Err(SyncError::Config(format!(
                    "time window starts after it ends ({} > {})",
                    from, to
                )));
            }
        }
        if self.reader.page_size == 0 {
            return Err(SyncError::Config("page_size must be positive".to_string()));
        }
        if self.reader.keep_alive_secs == 0 {
            return Err(SyncError::Config(
                "keep_alive_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-index traversal request derived from the run-level window
    pub fn extraction_request(&self, index: &str) -> ExtractionRequest {
        ExtractionRequest {
            index: index.to_string(),
            from: self.window.from,
            to: self.window.to,
            limit: self.limit,
        }
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Connection settings for one cluster
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Base URL, e.g. `https://localhost:9200`
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Log request bodies at debug level
    #[serde(default)]
    pub log_requests: bool,

    /// Log response bodies at debug level
    #[serde(default)]
    pub log_responses: bool,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Skip TLS certificate verification (self-signed cluster certificates)
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

fn default_request_timeout() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: None,
            password: None,
            log_requests: false,
            log_responses: false,
            request_timeout_ms: default_request_timeout(),
            accept_invalid_certs: default_true(),
        }
    }
}

impl ClusterConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Inclusive bounds on the `timestamp` field. An unset bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Window covering `since` up to now
    pub fn since(since: Duration) -> Self {
        let now = Utc::now();
        let since = chrono::Duration::from_std(since).unwrap_or(chrono::Duration::MAX);
        Self {
            from: now.checked_sub_signed(since),
            to: Some(now),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Cursor traversal settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaderConfig {
    /// Documents requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Point-in-time lease, renewed by each page fetch
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_page_size() -> usize {
    100
}

fn default_keep_alive() -> u64 {
    60
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl ReaderConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Bulk transmission settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkConfig {
    /// Concurrent `_bulk` requests
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Buffered bytes that trigger a flush
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,

    /// Maximum age of a buffered batch, in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Items queued ahead of the dispatcher before `add` waits
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_flush_bytes() -> usize {
    5_000_000
}

fn default_flush_interval() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            flush_bytes: default_flush_bytes(),
            flush_interval_ms: default_flush_interval(),
            queue_capacity: default_queue_capacity(),
            retry: RetryConfig::default(),
        }
    }
}

impl BulkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Exponential backoff for transient `_bulk` failures
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retry_on_status() -> Vec<u16> {
    RETRYABLE_STATUS.to_vec()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            retry_on_status: default_retry_on_status(),
        }
    }
}

impl RetryConfig {
    /// Fast retries for tests
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let initial = Duration::from_millis(self.initial_delay_ms);
        if attempt == 0 {
            return initial;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(initial.as_secs_f64() * multiplier);

        std::cmp::min(delay, Duration::from_millis(self.max_delay_ms))
    }

    /// Whether `err` is worth another attempt under this policy
    pub fn should_retry(&self, err: &SyncError) -> bool {
        match err {
            SyncError::SourceUnavailable { status, .. }
            | SyncError::DestinationUnavailable { status, .. } => {
                status.map_or(true, |s| self.retry_on_status.contains(&s))
            }
            other => other.is_retryable(),
        }
    }
}
