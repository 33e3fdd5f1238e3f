//! Error types for the Gatekeeper service.

use std::fmt;
use thiserror::Error;

/// Boxed error cause carried by [`StorageUnavailable`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A storage call failed while making an admission decision
    #[error("failed to {operation}: {source}")]
    Storage {
        operation: StorageOperation,
        #[source]
        source: StorageUnavailable,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Wrap a storage failure with the operation that produced it.
    pub fn storage(operation: StorageOperation, source: StorageUnavailable) -> Self {
        GatekeeperError::Storage { operation, source }
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

/// The storage step that was in flight when a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOperation {
    IsBlocked,
    IncrementCount,
    Block,
    GetCount,
    Close,
}

impl fmt::Display for StorageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            StorageOperation::IsBlocked => "check if key is blocked",
            StorageOperation::IncrementCount => "increment request count",
            StorageOperation::Block => "block key",
            StorageOperation::GetCount => "get request count",
            StorageOperation::Close => "close storage",
        };
        f.write_str(step)
    }
}

/// The only failure a storage backend reports: the medium could not be
/// reached, timed out, or has been closed.
#[derive(Error, Debug)]
#[error("storage unavailable: {reason}")]
pub struct StorageUnavailable {
    reason: String,
    #[source]
    source: Option<BoxError>,
}

impl StorageUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source(reason: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            reason: reason.into(),
            source: Some(source.into()),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
