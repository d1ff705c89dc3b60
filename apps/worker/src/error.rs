//! Error handling for the tsundoku worker
//!
//! [`WorkerError`] covers the worker process itself (configuration, storage,
//! registry and sink failures). Job handlers report their outcome to the
//! scheduler as a [`JobError`], which only distinguishes retryable from fatal
//! failures; the scheduler never looks inside the message.

use thiserror::Error;
use tsundoku_anidb_client::{AniDbError, ErrorClass};

use crate::store::StoreError;

/// Main worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    // ========== Job Processing Errors ==========
    /// Job payload is missing fields or malformed
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Job category is not registered
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// Job type registration rejected
    #[error("invalid job type registration: {0}")]
    Registration(String),

    /// Job payload could not be (de)serialized
    #[error("job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== Storage Errors ==========
    /// Database query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Job store operation failed
    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    /// Metadata sink rejected a record
    #[error("metadata sink error: {0}")]
    Sink(String),

    // ========== AniDB Errors ==========
    /// AniDB request failed
    #[error("AniDB error: {0}")]
    AniDb(#[from] AniDbError),

    // ========== Configuration Errors ==========
    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    // ========== Generic Errors ==========
    /// Internal error (unexpected state)
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::Store(_) | Self::Sink(_) => true,
            Self::AniDb(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration(_) | Self::Registration(_) => ErrorSeverity::Critical,

            Self::Database(_) | Self::Store(_) | Self::Sink(_) | Self::Internal(_) => {
                ErrorSeverity::Error
            }

            Self::AniDb(err) => match err.class() {
                ErrorClass::Fatal => ErrorSeverity::Error,
                _ => ErrorSeverity::Warning,
            },

            _ => ErrorSeverity::Info,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Critical worker error"
                );
            }
            ErrorSeverity::Error => {
                tracing::error!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Worker error"
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Worker warning"
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Worker info"
                );
            }
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that should trigger alerts
    Critical,
    /// Standard errors
    Error,
    /// Warnings for expected failures
    Warning,
    /// Informational messages
    Info,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Outcome of a failed job execution, as seen by the scheduler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Requeue with backoff while attempts remain
    #[error("{0}")]
    Retryable(String),

    /// Mark failed regardless of remaining attempts
    #[error("{0}")]
    Fatal(String),

    /// The service it depends on is paused (banned or backing off); requeue
    /// without spending an attempt
    #[error("{0}")]
    Paused(String),

    /// The job observed its cancellation signal
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<AniDbError> for JobError {
    fn from(err: AniDbError) -> Self {
        match err {
            AniDbError::Cancelled => return Self::Cancelled,
            AniDbError::Backoff { .. } => return Self::Paused(err.to_string()),
            _ => {}
        }
        match err.class() {
            ErrorClass::Fatal => Self::Fatal(err.to_string()),
            ErrorClass::Banned => Self::Paused(err.to_string()),
            ErrorClass::InvalidSession | ErrorClass::Transient => Self::Retryable(err.to_string()),
        }
    }
}

impl From<WorkerError> for JobError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::AniDb(err) => err.into(),
            err if err.is_retryable() => Self::Retryable(err.to_string()),
            err => Self::Fatal(err.to_string()),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self::Retryable(err.to_string())
    }
}
