use serde::{Deserialize, Serialize};
use strata_crypto::ContentHasher;
use strata_types::Digest;

use crate::error::{StoreError, StoreResult};

/// The kind of object stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Raw file content.
    Blob,
    /// Serialized layer record: parent digest plus change set.
    Layer,
}

impl ObjectKind {
    /// All kinds, in a fixed order.
    pub const ALL: [ObjectKind; 2] = [ObjectKind::Blob, ObjectKind::Layer];

    /// The domain-separated hasher for this kind.
    pub fn hasher(&self) -> &'static ContentHasher {
        match self {
            Self::Blob => &ContentHasher::BLOB,
            Self::Layer => &ContentHasher::LAYER,
        }
    }

    /// Directory name used by on-disk backends.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Layer => "layer",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A stored object: kind tag + raw bytes + cached size.
///
/// `StoredObject` is the unit of storage. The store never interprets the
/// contents of the data; it is a pure key-value store keyed by content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// The type of this object.
    pub kind: ObjectKind,
    /// The bytes of the object.
    pub data: Vec<u8>,
    /// The size of `data` in bytes.
    pub size: u64,
}

impl StoredObject {
    /// Create a new stored object from kind and data.
    pub fn new(kind: ObjectKind, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self { kind, data, size }
    }

    /// Shorthand for a file content blob.
    pub fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self::new(ObjectKind::Blob, data.into())
    }

    /// Compute the content-addressed digest for this object.
    pub fn compute_digest(&self) -> Digest {
        self.kind.hasher().hash(&self.data)
    }

    /// Check that the data hashes to `expected`.
    pub fn verify(&self, expected: &Digest) -> StoreResult<()> {
        let computed = self.compute_digest();
        if computed != *expected {
            return Err(StoreError::CorruptObject {
                digest: *expected,
                reason: format!("content hashes to {computed}"),
            });
        }
        Ok(())
    }

    /// Reconstruct an object from bytes of unknown kind, e.g. bytes handed
    /// back by a fetcher. The kind is whichever domain hashes to `digest`.
    pub fn identify(digest: &Digest, data: Vec<u8>) -> StoreResult<Self> {
        for kind in ObjectKind::ALL {
            if kind.hasher().verify(&data, digest) {
                return Ok(Self::new(kind, data));
            }
        }
        Err(StoreError::CorruptObject {
            digest: *digest,
            reason: "bytes do not hash to the requested digest".into(),
        })
    }

    /// Fail unless this object is of `expected` kind.
    pub fn expect_kind(&self, digest: &Digest, expected: ObjectKind) -> StoreResult<()> {
        if self.kind != expected {
            return Err(StoreError::KindMismatch {
                digest: *digest,
                expected,
                found: self.kind,
            });
        }
        Ok(())
    }
}
