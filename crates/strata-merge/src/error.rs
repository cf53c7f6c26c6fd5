//! Error types for the merge resolver.

use strata_layer::RegistryError;
use strata_store::StoreError;
use strata_types::{LayerPath, TypeError};

/// Errors that can occur while resolving a logical view.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The path is absent or masked by a whiteout.
    #[error("no such file or directory: {0}")]
    NotFound(LayerPath),

    /// File content was requested for a directory.
    #[error("is a directory: {0}")]
    IsADirectory(LayerPath),

    /// A path could not be normalized.
    #[error(transparent)]
    InvalidPath(#[from] TypeError),

    /// A chain member could not be obtained from the registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Content could not be read from the store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Materializing a view onto the host filesystem failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for merge results.
pub type MergeResult<T> = Result<T, MergeError>;
