//! Error types for the synchronization engine.
//!
//! None of these are fatal: a failed poll leaves local state unchanged and
//! the next cycle tries again. Only post failures and validation errors are
//! surfaced to the caller.

use thiserror::Error;

/// Unified error type for remote sources and the sync components
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport or auth failure while reading a feed. Retried next cycle.
    #[error("Remote fetch failed: {0}")]
    RemoteFetch(#[source] anyhow::Error),

    /// Sending a message failed. Never retried automatically.
    #[error("Remote post failed: {0}")]
    RemotePost(#[source] anyhow::Error),

    /// Rejected locally before any remote call
    #[error("Invalid input: {0}")]
    Validation(String),
}

impl SyncError {
    pub fn fetch(err: impl Into<anyhow::Error>) -> Self {
        SyncError::RemoteFetch(err.into())
    }

    pub fn post(err: impl Into<anyhow::Error>) -> Self {
        SyncError::RemotePost(err.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation(message.into())
    }

    /// Whether the next poll cycle may simply try again
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::RemoteFetch(_))
    }
}

impl From<shared_types::InvalidConversationId> for SyncError {
    fn from(err: shared_types::InvalidConversationId) -> Self {
        SyncError::Validation(err.to_string())
    }
}

/// Result type alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
