//! Error types for the local store, synchronization and domain services

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The local store could not be opened; persistence features are unusable
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Duplicate key '{key}' in collection {collection}")]
    DuplicateKey { collection: String, key: String },

    /// Any remote failure; the affected records stay pending
    #[error("Network error: {0}")]
    Network(String),

    #[error("Student {0} is already anonymized")]
    AlreadyAnonymized(String),

    #[error("Student {0} is still active")]
    StillActive(String),

    #[error("Consent {0} was already withdrawn")]
    AlreadyWithdrawn(String),

    /// Local audit persistence failed; never swallowed
    #[error("Audit write failure: {0}")]
    AuditWriteFailure(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A sync run for this collection is already in progress
    #[error("Synchronization already running for {0}")]
    Busy(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),
}

impl SyncError {
    /// Errors that leave state pending for a later retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Busy(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
