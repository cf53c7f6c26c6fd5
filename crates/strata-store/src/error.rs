use std::time::Duration;

use strata_types::Digest;

use crate::object::ObjectKind;

/// Errors from content store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found locally or through the fetcher.
    #[error("object not found: {0}")]
    NotFound(Digest),

    /// The object data does not hash to its digest, or cannot be decoded.
    #[error("corrupt object {digest}: {reason}")]
    CorruptObject { digest: Digest, reason: String },

    /// The object exists but has a different kind than requested.
    #[error("object {digest} is a {found}, expected a {expected}")]
    KindMismatch {
        digest: Digest,
        expected: ObjectKind,
        found: ObjectKind,
    },

    /// `release` was called on an object with no outstanding references.
    #[error("reference count underflow for {0}")]
    RefCountUnderflow(Digest),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend. Transient: retried
    /// before being surfaced.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller-supplied time bound elapsed before the operation succeeded.
    #[error("timed out after {elapsed:?} waiting for {digest}")]
    Timeout { digest: Digest, elapsed: Duration },

    /// The injected fetcher could not supply a missing object.
    #[error("fetch of {digest} failed: {reason}")]
    Fetch { digest: Digest, reason: String },

    /// Attempted to store an object under the null digest.
    #[error("cannot store object with null digest")]
    NullDigest,
}

impl StoreError {
    /// Whether the error is a transient backend fault worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
