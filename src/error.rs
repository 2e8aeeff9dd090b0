// ABOUTME: Error taxonomy for a sync run (source, sink, persistence, backend)
// ABOUTME: Maps each failure class to its retry policy and process exit code

use std::fmt;

/// Phase of a row-sink reconciliation pass in which a write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPhase {
    /// Reading all rows to build the row index
    Scan,
    /// The single batched in-place update
    Update,
    /// Single-row appends
    Append,
    /// Descending-order row deletions
    Delete,
}

impl fmt::Display for SinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SinkPhase::Scan => "scan",
            SinkPhase::Update => "update",
            SinkPhase::Append => "append",
            SinkPhase::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source connection failed: {0}")]
    SourceConnection(String),

    #[error("source query failed: {0}")]
    SourceQuery(String),

    #[error("sink authentication failed: {0}")]
    SinkAuth(String),

    #[error("sink write failed during {phase} phase: {message}")]
    SinkWrite { phase: SinkPhase, message: String },

    #[error("snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The backend could not be reached or did not answer in time
    #[error("backend request failed: {0}")]
    Backend(String),

    /// The backend answered but refused the request
    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Process exit codes consumed by the scheduler's alerting.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const DATABASE: i32 = 1;
    pub const SINK: i32 = 2;
    pub const UNCLASSIFIED: i32 = 3;
}

impl SyncError {
    pub fn sink_write(phase: SinkPhase, message: impl Into<String>) -> Self {
        SyncError::SinkWrite {
            phase,
            message: message.into(),
        }
    }

    /// Whether a retry with backoff is safe for this failure.
    ///
    /// Only connection establishment, read-only scans and the single batched
    /// update may be retried. Appends and deletions shift rows and are never
    /// retried. A backend that answered with an error status is not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SourceConnection(_) | SyncError::Backend(_) => true,
            SyncError::SinkWrite { phase, .. } => {
                matches!(phase, SinkPhase::Scan | SinkPhase::Update)
            }
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::SourceConnection(_) | SyncError::SourceQuery(_) => exit_code::DATABASE,
            SyncError::SinkAuth(_) | SyncError::SinkWrite { .. } => exit_code::SINK,
            _ => exit_code::UNCLASSIFIED,
        }
    }
}

/// Pick the exit code for an error returned from a command.
///
/// Walks the context chain looking for a classified [`SyncError`]; anything
/// else is unclassified.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SyncError>())
        .map(SyncError::exit_code)
        .unwrap_or(exit_code::UNCLASSIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_retry_policy() {
        assert!(SyncError::SourceConnection("refused".into()).is_retryable());
        assert!(!SyncError::SourceQuery("syntax".into()).is_retryable());
        assert!(!SyncError::SinkAuth("401".into()).is_retryable());
        assert!(SyncError::sink_write(SinkPhase::Update, "503").is_retryable());
        assert!(SyncError::sink_write(SinkPhase::Scan, "503").is_retryable());
        assert!(!SyncError::sink_write(SinkPhase::Append, "503").is_retryable());
        assert!(!SyncError::sink_write(SinkPhase::Delete, "503").is_retryable());
        assert!(!SyncError::Persistence("disk full".into()).is_retryable());
        assert!(SyncError::Backend("connection refused".into()).is_retryable());
        assert!(!SyncError::BackendRejected("400 Bad Request".into()).is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SyncError::SourceQuery("x".into()).exit_code(), 1);
        assert_eq!(SyncError::SourceConnection("x".into()).exit_code(), 1);
        assert_eq!(SyncError::SinkAuth("x".into()).exit_code(), 2);
        assert_eq!(
            SyncError::sink_write(SinkPhase::Delete, "x").exit_code(),
            2
        );
        assert_eq!(SyncError::Persistence("x".into()).exit_code(), 3);
    }

    #[test]
    fn test_exit_code_through_context() {
        let result: Result<(), SyncError> = Err(SyncError::SourceQuery("bad column".into()));
        let err = result.context("Failed to fetch appointments").unwrap_err();
        assert_eq!(exit_code_for(&err), exit_code::DATABASE);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), exit_code::UNCLASSIFIED);
    }

    #[test]
    fn test_sink_phase_display() {
        let err = SyncError::sink_write(SinkPhase::Append, "quota exceeded");
        assert_eq!(
            err.to_string(),
            "sink write failed during append phase: quota exceeded"
        );
    }
}
