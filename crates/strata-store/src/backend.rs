use strata_types::Digest;

use crate::error::StoreResult;
use crate::object::{ObjectKind, StoredObject};

/// Raw key-value persistence for objects, keyed by digest.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written. Writing the same digest twice stores
///   identical bytes, so a second write may be skipped or overwrite.
/// - Concurrent reads are always safe.
/// - The backend never interprets object contents and never tracks
///   references; counting lives in [`ContentStore`](crate::ContentStore).
/// - All I/O errors are propagated as [`StoreError::Io`](crate::StoreError::Io),
///   never silently ignored.
pub trait ObjectBackend: Send + Sync {
    /// Read an object by digest.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    fn read(&self, digest: &Digest) -> StoreResult<Option<StoredObject>>;

    /// Persist an object under its (pre-computed) digest.
    fn write(&self, digest: &Digest, object: &StoredObject) -> StoreResult<()>;

    /// Check whether an object exists.
    fn exists(&self, digest: &Digest) -> StoreResult<bool>;

    /// Delete an object. Returns `true` if the object existed.
    ///
    /// This is intended for garbage collection only.
    fn delete(&self, digest: &Digest) -> StoreResult<bool>;

    /// Enumerate every stored object as `(digest, kind, size)`.
    fn list(&self) -> StoreResult<Vec<(Digest, ObjectKind, u64)>>;
}
