//! Sync engine error types.

use splitsync_cloud::CloudError;
use splitsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The mutation was refused before anything was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The server rejected an operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An operation references an entity whose create failed or is unknown.
    #[error("dependency failed: {0}")]
    Dependency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("remote error: {0}")]
    Cloud(#[from] CloudError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("offline")]
    Offline,
}
