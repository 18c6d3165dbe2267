use std::time::Duration;
use thiserror::Error;

/// Status codes a transmission is retried on.
pub const RETRYABLE_STATUS: [u16; 4] = [429, 502, 503, 504];

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source unavailable{}: {}", status_suffix(.status), .reason)]
    SourceUnavailable { status: Option<u16>, reason: String },

    #[error("Destination unavailable{}: {}", status_suffix(.status), .reason)]
    DestinationUnavailable { status: Option<u16>, reason: String },

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Failed to create index '{index}': {reason}")]
    IndexCreateConflict { index: String, reason: String },

    #[error("Point-in-time expired: {0}")]
    SnapshotExpired(String),

    #[error("Point-in-time not found: {0}")]
    SnapshotNotFound(String),

    #[error("Failed to write document '{index}/{id}': {reason}")]
    WriteFailed {
        index: String,
        id: String,
        reason: String,
    },

    #[error("Flush did not complete within {0:?}")]
    FlushTimeout(Duration),

    #[error("Bulk writer is closed")]
    WriterClosed,

    #[error("Index task failed: {0}")]
    Task(String),

    #[error("Replication failed for {} index(es): {}", .failures.len(), summarize(.failures))]
    Replication { failures: Vec<IndexFailure> },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One index whose replication did not complete.
#[derive(Debug)]
pub struct IndexFailure {
    pub index: String,
    pub error: SyncError,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

fn summarize(failures: &[IndexFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("'{}': {}", f.index, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    /// Whether a retry of the same request could succeed: transport failures
    /// without a status, and throttling/gateway statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable { status, .. } | Self::DestinationUnavailable { status, .. } => {
                status.map_or(true, |s| RETRYABLE_STATUS.contains(&s))
            }
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Stable label for logs and metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::DestinationUnavailable { .. } => "destination_unavailable",
            Self::IndexNotFound(_) => "index_not_found",
            Self::IndexCreateConflict { .. } => "index_create_conflict",
            Self::SnapshotExpired(_) => "snapshot_expired",
            Self::SnapshotNotFound(_) => "snapshot_not_found",
            Self::WriteFailed { .. } => "write_failed",
            Self::FlushTimeout(_) => "flush_timeout",
            Self::WriterClosed => "writer_closed",
            Self::Task(_) => "task",
            Self::Replication { .. } => "replication",
            Self::Http(_) => "http",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Json(_) => "json",
            Self::Toml(_) => "toml",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let throttled = SyncError::DestinationUnavailable {
            status: Some(429),
            reason: "es_rejected_execution_exception".to_string(),
        };
        assert!(throttled.is_retryable());

        let transport = SyncError::SourceUnavailable {
            status: None,
            reason: "connection refused".to_string(),
        };
        assert!(transport.is_retryable());

        let internal = SyncError::DestinationUnavailable {
            status: Some(500),
            reason: "boom".to_string(),
        };
        assert!(!internal.is_retryable());
        assert!(!SyncError::IndexNotFound("logs".to_string()).is_retryable());
    }

    #[test]
    fn test_replication_summary_names_every_index() {
        let err = SyncError::Replication {
            failures: vec![
                IndexFailure {
                    index: "logs-a".to_string(),
                    error: SyncError::SnapshotExpired("pit-1".to_string()),
                },
                IndexFailure {
                    index: "logs-b".to_string(),
                    error: SyncError::SourceUnavailable {
                        status: Some(503),
                        reason: "unavailable".to_string(),
                    },
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("Replication failed for 2 index(es)"));
        assert!(msg.contains("'logs-a': Point-in-time expired: pit-1"));
        assert!(msg.contains("'logs-b': Source unavailable (503): unavailable"));
    }
}
