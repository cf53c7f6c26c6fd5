//! Error types for writable layers.

use strata_layer::RegistryError;
use strata_merge::MergeError;
use strata_store::StoreError;
use strata_types::{LayerPath, TypeError};
use uuid::Uuid;

/// Errors that can occur during writable layer operations.
#[derive(Debug, thiserror::Error)]
pub enum WritableError {
    /// The path is absent or whited out.
    #[error("no such file or directory: {0}")]
    NotFound(LayerPath),

    /// A path component that must be a directory is a file.
    #[error("not a directory: {0}")]
    NotADirectory(LayerPath),

    /// A file operation targeted a directory.
    #[error("is a directory: {0}")]
    IsADirectory(LayerPath),

    /// `mkdir` targeted an existing file.
    #[error("file exists: {0}")]
    AlreadyExists(LayerPath),

    /// The layer has been discarded.
    #[error("writable layer {id} is {state}")]
    InvalidState { id: Uuid, state: &'static str },

    /// A mutation raced with an in-flight commit of the same layer.
    #[error("conflicting write on writable layer {0}: a commit is in progress")]
    ConflictingWrite(Uuid),

    /// The operation's cancel flag was raised.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline passed.
    #[error("operation timed out")]
    Timeout,

    /// A positional write would end past the largest allowed file size.
    #[error("offset {offset} out of range for {path}")]
    InvalidOffset { path: LayerPath, offset: u64 },

    /// A path could not be normalized.
    #[error(transparent)]
    InvalidPath(#[from] TypeError),

    /// Error resolving the view below the layer.
    #[error("merge error: {0}")]
    Merge(MergeError),

    /// Error from the layer registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error from the content store.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<MergeError> for WritableError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::NotFound(path) => Self::NotFound(path),
            MergeError::IsADirectory(path) => Self::IsADirectory(path),
            MergeError::InvalidPath(e) => Self::InvalidPath(e),
            MergeError::Store(e) => e.into(),
            other => Self::Merge(other),
        }
    }
}

impl From<StoreError> for WritableError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout { .. } => Self::Timeout,
            other => Self::Store(other),
        }
    }
}

/// Convenience alias for writable layer results.
pub type WritableResult<T> = Result<T, WritableError>;
