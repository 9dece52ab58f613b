use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// The store did not durably accept the write.
    #[error("Write not acknowledged: {0}")]
    Unacknowledged(String),

    /// The version precondition of an optimistic write did not match.
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    /// The caller asked for something the configuration cannot provide.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Unsupported identity: {0}")]
    UnsupportedIdentity(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),
}

impl StorageError {
    /// Whether re-reading the document and retrying may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::LockConflict(_) | StorageError::LockTimeout(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
