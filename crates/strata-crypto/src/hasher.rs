use strata_types::Digest;

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag (e.g., `"strata-blob-v1"`,
/// `"strata-layer-v1"`) that is prepended to every hash computation. This
/// prevents cross-type hash collisions: a file blob and a layer record with
/// identical bytes will produce different digests.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for file content blobs.
    pub const BLOB: Self = Self {
        domain: "strata-blob-v1",
    };
    /// Hasher for serialized layer records.
    pub const LAYER: Self = Self {
        domain: "strata-layer-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        Digest::from_hash(*hasher.finalize().as_bytes())
    }

    /// Hash a serializable value as JSON with domain separation.
    pub fn hash_json<T: serde::Serialize>(&self, value: &T) -> Result<Digest, HasherError> {
        let data =
            serde_json::to_vec(value).map_err(|e| HasherError::Serialization(e.to_string()))?;
        Ok(self.hash(&data))
    }

    /// Verify that data produces the expected digest.
    pub fn verify(&self, data: &[u8], expected: &Digest) -> bool {
        self.hash(data) == *expected
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HasherError {
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let data = b"hello world";
        let d1 = ContentHasher::BLOB.hash(data);
        let d2 = ContentHasher::BLOB.hash(data);
        assert_eq!(d1, d2);
    }

    #[test]
    fn blob_and_layer_domains_differ() {
        let data = b"same content";
        assert_ne!(
            ContentHasher::BLOB.hash(data),
            ContentHasher::LAYER.hash(data)
        );
    }

    #[test]
    fn domain_hash_differs_from_raw_hash() {
        assert_ne!(ContentHasher::BLOB.hash(b"x"), Digest::from_bytes(b"x"));
    }

    #[test]
    fn verify_detects_tampering() {
        let id = ContentHasher::BLOB.hash(b"original");
        assert!(ContentHasher::BLOB.verify(b"original", &id));
        assert!(!ContentHasher::BLOB.verify(b"tampered", &id));
    }

    #[test]
    fn hash_json_matches_hash_of_serialized_bytes() {
        let value = serde_json::json!({"parent": null, "entries": {}});
        let via_json = ContentHasher::LAYER.hash_json(&value).unwrap();
        let bytes = serde_json::to_vec(&value).unwrap();
        assert_eq!(via_json, ContentHasher::LAYER.hash(&bytes));
    }

    #[test]
    fn custom_domain() {
        let hasher = ContentHasher::new("my-custom-domain-v1");
        assert_eq!(hasher.domain(), "my-custom-domain-v1");
        assert_ne!(hasher.hash(b"data"), ContentHasher::BLOB.hash(b"data"));
    }
}
