//! Error types for StorySync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in StorySync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another run holds the cursor lock.
    #[error("cursor locked: another run has exclusive access to {path}")]
    CursorLocked {
        /// Directory whose lock is held.
        path: String,
    },

    /// Cursor directory or file has an unexpected shape.
    #[error("invalid cursor format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A record failed validation.
    #[error("invalid record {key}: {reason}")]
    InvalidRecord {
        /// External key as seen (may be empty).
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl CoreError {
    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid record error.
    pub fn invalid_record(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
