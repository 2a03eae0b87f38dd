//! Error types and handling
//!
//! This module provides the error types used throughout the Pulse engine.
//! All errors implement the `ErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! Error messages never include API keys or other credentials.

use thiserror::Error;

/// Trait for Pulse error extensions
///
/// Provides additional context for errors: a hint safe to show to the
/// operator, and whether retrying can help.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require a configuration fix or manual intervention.
    fn is_recoverable(&self) -> bool;
}

/// Errors from the event store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another batch already holds the running status. The scheduler
    /// treats this as "skip this tick", not as an operator-visible error.
    #[error("Another processing batch is already running")]
    BatchRunning,

    #[error("Batch {0} is not running")]
    BatchNotRunning(i64),

    #[error("Invalid timestamp in row: {0}")]
    Timestamp(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from the classifier and its completion backend
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClassifierError {
    /// Whether a retry with backoff has any chance of succeeding.
    ///
    /// Auth failures, malformed requests, and schema violations fail
    /// immediately; schema violations go through the separate reformat
    /// path instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClassifierError::RateLimited
                | ClassifierError::ServerError(_)
                | ClassifierError::NetworkError(_)
                | ClassifierError::Timeout
        )
    }
}

/// Main engine error type
///
/// Every failure inside a batch run is converted into this type at the
/// scheduler boundary, recorded on the batch row via `fail`, and never
/// crosses into the next tick.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error("Daemon already running")]
    DaemonAlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for PipelineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Store(StoreError::BatchRunning) => {
                "A batch is already in flight. Wait for it to finish"
            }
            Self::Store(_) => "Database operation failed. Try restarting the daemon",
            Self::Classifier(ClassifierError::AuthenticationFailed(_)) => {
                "Check the PULSE_API_KEY environment variable"
            }
            Self::Classifier(ClassifierError::MalformedResponse(_)) => {
                "The completion service returned unusable output. The batch will be retried"
            }
            Self::Classifier(_) => "Completion service unavailable. Check your network",
            Self::DaemonAlreadyRunning => "Stop the existing daemon first with 'pulse stop'",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::DaemonAlreadyRunning => false,
            Self::Classifier(ClassifierError::AuthenticationFailed(_)) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClassifierError::RateLimited.is_transient());
        assert!(ClassifierError::Timeout.is_transient());
        assert!(ClassifierError::NetworkError("reset".into()).is_transient());
        assert!(ClassifierError::ServerError("503".into()).is_transient());
        assert!(!ClassifierError::AuthenticationFailed("401".into()).is_transient());
        assert!(!ClassifierError::MalformedResponse("shape".into()).is_transient());
        assert!(!ClassifierError::InvalidRequest("400".into()).is_transient());
    }

    #[test]
    fn test_recoverability() {
        assert!(!PipelineError::Config("bad".into()).is_recoverable());
        assert!(!PipelineError::DaemonAlreadyRunning.is_recoverable());
        assert!(PipelineError::Store(StoreError::BatchRunning).is_recoverable());
        assert!(PipelineError::Classifier(ClassifierError::Timeout).is_recoverable());
    }
}
