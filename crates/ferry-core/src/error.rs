//! Error types for Ferry core

use ferry_types::{JobId, JobState};
use thiserror::Error;

/// Errors that can occur in Ferry core
#[derive(Debug, Error)]
pub enum FerryError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The response body stopped mid-transfer; eligible for one fallback attempt
    #[error("Stream closed: {0}")]
    StreamClosed(std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("Resume rejected: {0}")]
    ResumeRejected(String),

    #[error("Server error: status {status}")]
    ServerError { status: u16 },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Download was paused")]
    Paused,

    #[error("Download was cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl FerryError {
    /// Classify a body read failure. Closures of the underlying connection are
    /// transient; anything else (timeouts included) is fatal for the run.
    pub fn from_read(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted => FerryError::StreamClosed(err),
            _ => FerryError::Io(err),
        }
    }

    pub fn is_stream_closure(&self) -> bool {
        matches!(self, FerryError::StreamClosed(_))
    }

    /// Paused or cancelled runs end with these; they are not failures
    pub fn is_stop(&self) -> bool {
        matches!(self, FerryError::Paused | FerryError::Cancelled)
    }
}

/// Failure of a notification target. Logged and dropped, never fatal.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification target closed")]
    Closed,

    #[error("Notification failed: {0}")]
    Other(String),
}
