//! Error types for live queries.

use crate::types::{DocumentId, Namespace};
use thiserror::Error;

/// Main error type for live query operations.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Duplicate document id {id} in {namespace}")]
    DuplicateId { namespace: Namespace, id: DocumentId },

    #[error("Change stream connection failed: {0}")]
    Connection(String),

    #[error("Change stream is not connected")]
    NotConnected,

    #[error("Listener has shut down")]
    ListenerShutdown,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiveError {
    /// Whether the failed operation can be retried as-is.
    ///
    /// Only connection-level failures are transient; everything else is a
    /// malformed input or a programming error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LiveError::Connection(_) | LiveError::NotConnected)
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::Serialization(e.to_string())
    }
}

/// Result type for live query operations.
pub type Result<T> = std::result::Result<T, LiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(LiveError::Connection("reset by peer".into()).is_retryable());
        assert!(LiveError::NotConnected.is_retryable());
        assert!(!LiveError::InvalidFilter("bad".into()).is_retryable());
        assert!(!LiveError::ListenerShutdown.is_retryable());
    }
}
