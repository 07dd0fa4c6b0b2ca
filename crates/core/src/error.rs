//! Shared error taxonomy for the sync engine.
//!
//! Every error carries a retry classification: validation and not-found
//! failures are fatal on first occurrence (retrying cannot change the
//! outcome), everything else is transient and subject to the retry policy.

use thiserror::Error;

/// Result type used across the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Retry classification of an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input; never retried.
    Validation,
    /// A document/entity a later phase expected to exist is missing; never retried.
    NotFound,
    /// Infrastructure or upstream failure; retried per the shared policy.
    Transient,
}

/// Engine-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Input failed validation (e.g. missing tenantId/authToken, unknown signal type).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A required record was not found (e.g. status document missing).
    #[error("not found: {0}")]
    NotFound(String),

    /// Status store unavailable or a persisted write failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The upstream system of record failed or misbehaved.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An activity exceeded its start-to-close timeout.
    #[error("activity '{activity}' timed out after {elapsed_ms}ms")]
    Timeout { activity: String, elapsed_ms: u64 },

    /// A signal handler activity failed.
    #[error("handler error: {0}")]
    Handler(String),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Retry classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) | Self::Upstream(_) | Self::Timeout { .. } | Self::Handler(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// Whether the shared retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Stable wire string for result objects and DLQ entries.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
            Self::Upstream(_) => "upstream",
            Self::Timeout { .. } => "timeout",
            Self::Handler(_) => "handler",
        }
    }
}
