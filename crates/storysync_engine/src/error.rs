//! Error types for the sync engine.

use std::time::Duration;
use storysync_core::ExternalKey;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The destination asked us to slow down.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Delay requested by the destination.
        retry_after: Duration,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Upstream has no record with this key.
    #[error("record not found: {key}")]
    NotFound {
        /// The key that was looked up.
        key: ExternalKey,
    },

    /// The destination rejected the document shape (missing required field,
    /// schema mismatch). Never retried.
    #[error("destination rejected document: {0}")]
    Structural(String),

    /// More than one destination document carries the same external key.
    #[error("duplicate destination documents for {key}: {destination_ids:?}")]
    DuplicateDestination {
        /// The shared external key.
        key: ExternalKey,
        /// Identifiers of every matching document.
        destination_ids: Vec<String>,
    },

    /// A record could not be enriched.
    #[error("enrichment failed for {key}: {cause}")]
    Enrichment {
        /// The record's key.
        key: ExternalKey,
        /// What went wrong.
        cause: String,
    },

    /// Retry budget used up; carries the last error.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<SyncError>,
    },

    /// Cursor or record model error.
    #[error("core error: {0}")]
    Core(#[from] storysync_core::CoreError),

    /// The safety gate refused the invocation.
    #[error("safety gate denied: {0}")]
    GateDenied(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an enrichment error.
    pub fn enrichment(key: &ExternalKey, cause: impl Into<String>) -> Self {
        Self::Enrichment {
            key: key.clone(),
            cause: cause.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } | SyncError::Timeout => true,
            SyncError::Transport { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns the destination's requested delay, if this is a rate limit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Returns the innermost error, looking through exhausted retries.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::RetriesExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("bad credentials").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::RateLimited {
            retry_after: Duration::from_millis(5)
        }
        .is_retryable());
        assert!(!SyncError::Structural("missing title".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn root_cause_unwraps_exhaustion() {
        let err = SyncError::RetriesExhausted {
            attempts: 3,
            last: Box::new(SyncError::RateLimited {
                retry_after: Duration::from_secs(1),
            }),
        };
        assert_eq!(err.root_cause().retry_after(), Some(Duration::from_secs(1)));
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn error_display() {
        let err = SyncError::DuplicateDestination {
            key: ExternalKey::new("A"),
            destination_ids: vec!["p1".into(), "p2".into()],
        };
        let text = err.to_string();
        assert!(text.contains("A"));
        assert!(text.contains("p1"));
        assert!(text.contains("p2"));
    }
}
