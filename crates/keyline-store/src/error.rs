//! Error types for storage gateway operations.

use std::time::Duration;

/// Errors that can occur while talking to a storage gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The gateway is not connected.
    #[error("storage gateway is disconnected")]
    Disconnected,

    /// The operation did not complete within its deadline.
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused the operation for now.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The storage backend reported an error.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// A different record is already stored under this sequence or epoch.
    #[error("a different record is already stored under {0}")]
    Conflict(u64),

    /// A stored record is inconsistent with the key it was stored under.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Disconnected
                | StoreError::Timeout(_)
                | StoreError::Unavailable(_)
                | StoreError::Backend(_)
        )
    }
}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
