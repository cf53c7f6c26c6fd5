//! The reference-counted content store.
//!
//! [`ContentStore`] layers reference counting, retry and fetch-on-miss on top
//! of an [`ObjectBackend`]. Counting metadata lives in a single `RwLock`'d map
//! that is never held across backend I/O. A separate sweep gate serializes
//! [`ContentStore::sweep`] against the insertion of new objects, so a sweep can
//! never delete bytes that a concurrent `put` has just brought back to life.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use strata_types::Digest;
use tracing::{debug, info, warn};

use crate::backend::ObjectBackend;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::fetch::BlobFetcher;
use crate::memory::InMemoryBackend;
use crate::object::{ObjectKind, StoredObject};

/// Per-object bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub kind: ObjectKind,
    pub size: u64,
    /// Outstanding references. Zero means eligible for the next sweep.
    pub ref_count: u64,
}

/// Aggregate counters, see [`ContentStore::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: usize,
    pub blobs: usize,
    pub layers: usize,
    pub bytes: u64,
    /// Objects with a zero count, awaiting collection.
    pub unreferenced: usize,
}

/// Result of a sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Objects removed from the backend.
    pub removed: Vec<(Digest, ObjectKind)>,
    /// Bytes reclaimed.
    pub bytes: u64,
    /// Objects whose deletion failed; they stay eligible for the next sweep.
    pub failed: usize,
}

impl SweepReport {
    /// Number of removed objects of the given kind.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.removed.iter().filter(|(_, k)| *k == kind).count()
    }
}

/// Reference-counted content-addressed store.
pub struct ContentStore {
    backend: Arc<dyn ObjectBackend>,
    meta: RwLock<HashMap<Digest, ObjectMeta>>,
    sweep_gate: RwLock<()>,
    fetcher: Option<Arc<dyn BlobFetcher>>,
    config: StoreConfig,
}

impl ContentStore {
    /// Create a store over an empty backend.
    ///
    /// Objects already present in `backend` are invisible until
    /// [`ContentStore::open`] is used instead.
    pub fn new(backend: Arc<dyn ObjectBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            meta: RwLock::new(HashMap::new()),
            sweep_gate: RwLock::new(()),
            fetcher: None,
            config,
        }
    }

    /// A store over a fresh [`InMemoryBackend`] with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Open a store over a backend that may already hold objects.
    ///
    /// Every existing object starts with a zero reference count; the layer
    /// registry re-establishes counts when it is opened on top of this store.
    /// Do not sweep before that has happened.
    pub fn open(backend: Arc<dyn ObjectBackend>, config: StoreConfig) -> StoreResult<Self> {
        let store = Self::new(backend, config);
        let listed = store.backend.list()?;
        {
            let mut meta = store.meta_write();
            for (digest, kind, size) in &listed {
                meta.insert(
                    *digest,
                    ObjectMeta {
                        kind: *kind,
                        size: *size,
                        ref_count: 0,
                    },
                );
            }
        }
        info!(objects = listed.len(), "opened content store");
        Ok(store)
    }

    /// Consult `fetcher` whenever an object is missing locally.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn BlobFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// The store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ---------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------

    /// Store file content and count one reference to it.
    ///
    /// Idempotent: identical bytes always yield the same digest and are
    /// stored once; each call adds one reference.
    pub fn put(&self, data: &[u8]) -> StoreResult<Digest> {
        self.put_object(&StoredObject::blob(data))
    }

    /// Store an object of any kind and count one reference to it.
    pub fn put_object(&self, object: &StoredObject) -> StoreResult<Digest> {
        let digest = object.compute_digest();
        if digest.is_null() {
            return Err(StoreError::NullDigest);
        }

        if self.bump_existing(&digest, object.kind)? {
            return Ok(digest);
        }

        // New object: write it while holding the sweep gate shared, then
        // publish the count.
        let _gate = self.gate_read();
        self.with_retry("write", &digest, None, || {
            self.backend.write(&digest, object)
        })?;
        let count = {
            let mut meta = self.meta_write();
            let entry = meta.entry(digest).or_insert(ObjectMeta {
                kind: object.kind,
                size: object.size,
                ref_count: 0,
            });
            entry.ref_count += 1;
            entry.ref_count
        };
        debug!(digest = %digest.short_hex(), kind = %object.kind, size = object.size, refs = count, "stored object");
        Ok(digest)
    }

    /// Increment the count of an already-known object. Returns `false` if the
    /// object is unknown.
    fn bump_existing(&self, digest: &Digest, kind: ObjectKind) -> StoreResult<bool> {
        let mut meta = self.meta_write();
        let Some(entry) = meta.get_mut(digest) else {
            return Ok(false);
        };
        if entry.kind != kind {
            return Err(StoreError::KindMismatch {
                digest: *digest,
                expected: kind,
                found: entry.kind,
            });
        }
        entry.ref_count += 1;
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Retrieval
    // ---------------------------------------------------------------

    /// Read file content, bounded by the configured read timeout.
    pub fn get(&self, digest: &Digest) -> StoreResult<Vec<u8>> {
        let deadline = self.config.read_timeout.map(|t| Instant::now() + t);
        self.get_with_deadline(digest, deadline)
    }

    /// Read file content, giving up once `timeout` has elapsed.
    pub fn get_with_timeout(&self, digest: &Digest, timeout: Duration) -> StoreResult<Vec<u8>> {
        self.get_with_deadline(digest, Some(Instant::now() + timeout))
    }

    /// Read file content, giving up at `deadline` if one is given.
    pub fn get_with_deadline(
        &self,
        digest: &Digest,
        deadline: Option<Instant>,
    ) -> StoreResult<Vec<u8>> {
        let object = self.load(digest, deadline)?;
        object.expect_kind(digest, ObjectKind::Blob)?;
        Ok(object.data)
    }

    /// Read an object of any kind.
    pub fn get_object(&self, digest: &Digest) -> StoreResult<StoredObject> {
        let deadline = self.config.read_timeout.map(|t| Instant::now() + t);
        self.load(digest, deadline)
    }

    fn load(&self, digest: &Digest, deadline: Option<Instant>) -> StoreResult<StoredObject> {
        let local = self.with_retry("read", digest, deadline, || self.backend.read(digest))?;
        let object = match local {
            Some(object) => object,
            None => self.fetch_and_ingest(digest, deadline, 0)?,
        };
        if self.config.verify_reads {
            object.verify(digest)?;
        }
        Ok(object)
    }

    /// Pull a missing object through the fetcher, verify it, persist it and
    /// publish it with `initial_refs` references.
    fn fetch_and_ingest(
        &self,
        digest: &Digest,
        deadline: Option<Instant>,
        initial_refs: u64,
    ) -> StoreResult<StoredObject> {
        let Some(fetcher) = self.fetcher.as_ref() else {
            return Err(StoreError::NotFound(*digest));
        };
        let bytes = self.with_retry("fetch", digest, deadline, || {
            fetcher.fetch_missing(digest)
        })?;
        let object = StoredObject::identify(digest, bytes)?;

        let _gate = self.gate_read();
        self.with_retry("write", digest, deadline, || {
            self.backend.write(digest, &object)
        })?;
        {
            let mut meta = self.meta_write();
            let entry = meta.entry(*digest).or_insert(ObjectMeta {
                kind: object.kind,
                size: object.size,
                ref_count: 0,
            });
            entry.ref_count += initial_refs;
        }
        info!(digest = %digest.short_hex(), kind = %object.kind, size = object.size, "ingested fetched object");
        Ok(object)
    }

    // ---------------------------------------------------------------
    // Reference counting
    // ---------------------------------------------------------------

    /// Add a reference. Unknown digests are fetched if a fetcher is
    /// configured, otherwise fail with `NotFound`. Returns the new count.
    pub fn retain(&self, digest: &Digest) -> StoreResult<u64> {
        {
            let mut meta = self.meta_write();
            if let Some(entry) = meta.get_mut(digest) {
                entry.ref_count += 1;
                return Ok(entry.ref_count);
            }
        }
        let deadline = self.config.read_timeout.map(|t| Instant::now() + t);
        self.fetch_and_ingest(digest, deadline, 1)?;
        Ok(self.ref_count(digest).unwrap_or(1))
    }

    /// Drop a reference. Reaching zero makes the object eligible for the next
    /// [`sweep`](Self::sweep) but deletes nothing. Returns the new count.
    pub fn release(&self, digest: &Digest) -> StoreResult<u64> {
        let mut meta = self.meta_write();
        let entry = meta
            .get_mut(digest)
            .ok_or(StoreError::NotFound(*digest))?;
        if entry.ref_count == 0 {
            return Err(StoreError::RefCountUnderflow(*digest));
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            debug!(digest = %digest.short_hex(), kind = %entry.kind, "object eligible for collection");
        }
        Ok(entry.ref_count)
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// Whether the store knows `digest` (without consulting the fetcher).
    pub fn exists(&self, digest: &Digest) -> bool {
        self.meta_read().contains_key(digest)
    }

    /// Current reference count, if the object is known.
    pub fn ref_count(&self, digest: &Digest) -> Option<u64> {
        self.meta_read().get(digest).map(|m| m.ref_count)
    }

    /// Bookkeeping for one object.
    pub fn meta(&self, digest: &Digest) -> Option<ObjectMeta> {
        self.meta_read().get(digest).copied()
    }

    /// All known digests of one kind, sorted.
    pub fn digests_of_kind(&self, kind: ObjectKind) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self
            .meta_read()
            .iter()
            .filter(|(_, m)| m.kind == kind)
            .map(|(d, _)| *d)
            .collect();
        digests.sort();
        digests
    }

    /// Aggregate counters.
    pub fn stats(&self) -> StoreStats {
        let meta = self.meta_read();
        let mut stats = StoreStats {
            objects: meta.len(),
            ..Default::default()
        };
        for m in meta.values() {
            match m.kind {
                ObjectKind::Blob => stats.blobs += 1,
                ObjectKind::Layer => stats.layers += 1,
            }
            stats.bytes += m.size;
            if m.ref_count == 0 {
                stats.unreferenced += 1;
            }
        }
        stats
    }

    // ---------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------

    /// Delete every object whose count is zero.
    ///
    /// Intended for the garbage collector only. Runs in batches rather than on
    /// every release so readers never wait on deletions.
    pub fn sweep(&self) -> StoreResult<SweepReport> {
        let _gate = self
            .sweep_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let doomed: Vec<(Digest, ObjectMeta)> = {
            let mut meta = self.meta_write();
            let doomed: Vec<(Digest, ObjectMeta)> = meta
                .iter()
                .filter(|(_, m)| m.ref_count == 0)
                .map(|(d, m)| (*d, *m))
                .collect();
            for (digest, _) in &doomed {
                meta.remove(digest);
            }
            doomed
        };

        let mut report = SweepReport::default();
        for (digest, meta) in doomed {
            match self.with_retry("delete", &digest, None, || self.backend.delete(&digest)) {
                Ok(_) => {
                    report.removed.push((digest, meta.kind));
                    report.bytes += meta.size;
                }
                Err(e) => {
                    warn!(digest = %digest.short_hex(), error = %e, "failed to delete object, keeping it for the next sweep");
                    self.meta_write().entry(digest).or_insert(meta);
                    report.failed += 1;
                }
            }
        }

        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), bytes = report.bytes, "swept unreferenced objects");
        }
        Ok(report)
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    /// Run `op`, retrying transient failures with bounded backoff.
    fn with_retry<T>(
        &self,
        op: &'static str,
        digest: &Digest,
        deadline: Option<Instant>,
        mut f: impl FnMut() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let policy = &self.config.retry;
        let started = Instant::now();
        let timed_out = |extra: Duration| {
            deadline.is_some_and(|deadline| Instant::now() + extra >= deadline)
        };

        let mut attempt = 1;
        loop {
            if timed_out(Duration::ZERO) {
                return Err(StoreError::Timeout {
                    digest: *digest,
                    elapsed: started.elapsed(),
                });
            }
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff_for(attempt);
                    if timed_out(delay) {
                        return Err(StoreError::Timeout {
                            digest: *digest,
                            elapsed: started.elapsed(),
                        });
                    }
                    warn!(op, digest = %digest.short_hex(), attempt, ?delay, error = %e, "transient store failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn meta_read(&self) -> RwLockReadGuard<'_, HashMap<Digest, ObjectMeta>> {
        self.meta.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta_write(&self) -> RwLockWriteGuard<'_, HashMap<Digest, ObjectMeta>> {
        self.meta.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate_read(&self) -> RwLockReadGuard<'_, ()> {
        self.sweep_gate.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ContentStore")
            .field("objects", &stats.objects)
            .field("bytes", &stats.bytes)
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}
