use strata_types::Digest;

use crate::error::StoreResult;

/// Supplies objects that are not present locally, e.g. by pulling a layer
/// from a registry. Transport is out of scope for the store; this capability
/// is injected by the embedding application.
///
/// Returning [`StoreError::Io`](crate::StoreError::Io) marks the failure as
/// transient and the store retries it under its [`RetryPolicy`](crate::RetryPolicy).
/// Bytes are verified against `digest` before they are ingested.
pub trait BlobFetcher: Send + Sync {
    /// Fetch the raw bytes of the object identified by `digest`.
    fn fetch_missing(&self, digest: &Digest) -> StoreResult<Vec<u8>>;
}

impl<F> BlobFetcher for F
where
    F: Fn(&Digest) -> StoreResult<Vec<u8>> + Send + Sync,
{
    fn fetch_missing(&self, digest: &Digest) -> StoreResult<Vec<u8>> {
        self(digest)
    }
}
