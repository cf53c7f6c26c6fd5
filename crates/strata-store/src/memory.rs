use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_types::Digest;

use crate::backend::ObjectBackend;
use crate::error::StoreResult;
use crate::object::{ObjectKind, StoredObject};

/// Object backend kept entirely in a `HashMap`, for tests and embedding.
///
/// Objects are cloned on the way in and out.
#[derive(Default)]
pub struct InMemoryBackend {
    objects: RwLock<HashMap<Digest, StoredObject>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Sum of stored object sizes.
    pub fn total_bytes(&self) -> u64 {
        self.objects().values().map(|obj| obj.size).sum()
    }

    /// Drop an object without the content store noticing, as if the medium
    /// lost it.
    pub fn forget(&self, digest: &Digest) -> bool {
        self.objects_mut().remove(digest).is_some()
    }

    fn objects(&self) -> RwLockReadGuard<'_, HashMap<Digest, StoredObject>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn objects_mut(&self) -> RwLockWriteGuard<'_, HashMap<Digest, StoredObject>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObjectBackend for InMemoryBackend {
    fn read(&self, digest: &Digest) -> StoreResult<Option<StoredObject>> {
        Ok(self.objects().get(digest).cloned())
    }

    fn write(&self, digest: &Digest, object: &StoredObject) -> StoreResult<()> {
        self.objects_mut()
            .entry(*digest)
            .or_insert_with(|| object.clone());
        Ok(())
    }

    fn exists(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(self.objects().contains_key(digest))
    }

    fn delete(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(self.objects_mut().remove(digest).is_some())
    }

    fn list(&self) -> StoreResult<Vec<(Digest, ObjectKind, u64)>> {
        let mut all: Vec<_> = self
            .objects()
            .iter()
            .map(|(digest, obj)| (*digest, obj.kind, obj.size))
            .collect();
        all.sort_by_key(|(digest, _, _)| *digest);
        Ok(all)
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("objects", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(backend: &InMemoryBackend, content: &[u8]) -> Digest {
        let obj = StoredObject::blob(content.to_vec());
        let digest = obj.compute_digest();
        backend.write(&digest, &obj).unwrap();
        digest
    }

    #[test]
    fn write_and_read() {
        let backend = InMemoryBackend::new();
        let digest = put(&backend, b"hello world");
        let read_back = backend.read(&digest).unwrap().expect("should exist");
        assert_eq!(read_back.data, b"hello world");
        assert_eq!(read_back.compute_digest(), digest);
    }

    #[test]
    fn duplicate_write_keeps_one_copy() {
        let backend = InMemoryBackend::new();
        let d1 = put(&backend, b"identical content");
        let d2 = put(&backend, b"identical content");
        assert_eq!(d1, d2);
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn delete_reports_presence() {
        let backend = InMemoryBackend::new();
        let digest = put(&backend, b"to-delete");
        assert!(backend.delete(&digest).unwrap());
        assert!(!backend.exists(&digest).unwrap());
        assert!(!backend.delete(&digest).unwrap());
    }

    #[test]
    fn read_missing_returns_none() {
        let backend = InMemoryBackend::new();
        assert!(backend.read(&Digest::from_bytes(b"missing")).unwrap().is_none());
    }

    #[test]
    fn list_is_sorted_with_sizes() {
        let backend = InMemoryBackend::new();
        put(&backend, b"aaa");
        put(&backend, b"bbbb");
        let all = backend.list().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].0 <= all[1].0);
        assert_eq!(backend.total_bytes(), 7);
    }

    #[test]
    fn forget_removes_silently() {
        let backend = InMemoryBackend::new();
        let digest = put(&backend, b"x");
        assert!(backend.forget(&digest));
        assert!(backend.is_empty());
    }

    #[test]
    fn debug_format() {
        let backend = InMemoryBackend::new();
        put(&backend, b"x");
        let debug = format!("{backend:?}");
        assert!(debug.contains("InMemoryBackend"));
        assert!(debug.contains("objects: 1"));
    }
}
