//! Error types for the garbage collector.

use strata_layer::RegistryError;
use strata_store::StoreError;

/// Errors that can occur during a collection.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// Unregistering a layer failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Sweeping the content store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The blocking collection task did not complete.
    #[error("collection task failed: {0}")]
    Task(String),
}

/// Convenience alias for collector results.
pub type GcResult<T> = Result<T, GcError>;
