//! Error types for the epoch builder.

use std::fmt;

use keyline_store::StoreError;

use crate::validator::ValidationError;

/// Caller-visible outcome of a builder operation, one-to-one with the RPC
/// status codes an adapter would return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The operation succeeded.
    Ok,
    /// The request was well formed but semantically invalid.
    InvalidArgument,
    /// The request or stored state could not be processed.
    Internal,
    /// The operation may succeed if retried later.
    Unavailable,
    /// The request was not authorized.
    PermissionDenied,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during builder operations.
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    /// The update failed validation or authorization.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The storage gateway failed or timed out.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A seal is in progress or awaiting retry; submissions are refused.
    #[error("epoch {epoch} is sealing")]
    EpochSealing {
        /// Epoch being sealed.
        epoch: u64,
    },

    /// The builder has been closed.
    #[error("builder is closed")]
    Closed,

    /// Persisted state is inconsistent and cannot be replayed.
    #[error("corrupt log: {0}")]
    Corruption(String),
}

impl BuilderError {
    /// Status code a caller should observe for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            BuilderError::Validation(ValidationError::Decode(_)) => StatusCode::Internal,
            BuilderError::Validation(ValidationError::IndexLength { .. }) => {
                StatusCode::InvalidArgument
            }
            BuilderError::Validation(ValidationError::Unauthorized(_)) => {
                StatusCode::PermissionDenied
            }
            BuilderError::EpochSealing { .. } | BuilderError::Closed => StatusCode::Unavailable,
            BuilderError::Storage(
                StoreError::Timeout(_) | StoreError::Disconnected | StoreError::Unavailable(_),
            ) => {
                StatusCode::Unavailable
            }
            BuilderError::Storage(_) | BuilderError::Corruption(_) => StatusCode::Internal,
        }
    }
}

/// Status code of a builder result.
pub fn status_of<T>(result: &Result<T, BuilderError>) -> StatusCode {
    match result {
        Ok(_) => StatusCode::Ok,
        Err(e) => e.code(),
    }
}
