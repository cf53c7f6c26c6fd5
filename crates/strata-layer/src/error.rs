//! Error types for the layer registry.

use strata_store::StoreError;
use strata_types::{Digest, TypeError};

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A referenced layer is not registered.
    #[error("layer not found: {0}")]
    NotFound(Digest),

    /// An ancestor of `tip` is missing from both the registry and the store.
    #[error("broken chain: {tip} references missing ancestor {missing}")]
    BrokenChain {
        /// The layer whose chain was being resolved.
        tip: Digest,
        /// The first ancestor that could not be found.
        missing: Digest,
    },

    /// A layer was reached twice while walking parents.
    #[error("cycle detected at layer {0}")]
    CycleDetected(Digest),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A path in a change set could not be normalized.
    #[error(transparent)]
    InvalidPath(#[from] TypeError),

    /// Error from the underlying content store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience alias for registry results.
pub type RegistryResult<T> = Result<T, RegistryError>;
