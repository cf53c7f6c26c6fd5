//! The layer registry: an arena of immutable layers keyed by digest.
//!
//! [`LayerRegistry`] stores layers in a [`HashMap`] of `Arc<Layer>` and keeps
//! a forward-edge index (`children`) for the garbage collector. Layers are
//! inserted fully formed under the write lock, so a reader either sees a
//! layer with all of its records or does not see it at all.
//!
//! # Reference accounting
//!
//! Every registered layer holds, in the content store:
//!
//! - one reference to its own record (the registration reference),
//! - one reference to its parent's record (chain of custody),
//! - one reference per content blob named by its records.
//!
//! A layer's *structural* count is therefore `1 + children`. Anything above
//! that comes from a [`ChainLease`] or another external holder.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_store::{ContentStore, ObjectKind, StoreError};
use strata_types::{Digest, LayerPath};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::layer::{Entries, Layer, LayerChain};
use crate::record::{ChangeRecord, EntryMode, FileMeta};

#[derive(Default)]
struct RegistryState {
    layers: HashMap<Digest, Arc<Layer>>,
    children: HashMap<Digest, BTreeSet<Digest>>,
}

impl RegistryState {
    /// Walk parents from `tip` to the base using only registered layers.
    /// A missing layer is reported as `NotFound(missing)`.
    fn walk(&self, tip: &Digest) -> RegistryResult<Vec<Digest>> {
        let mut digests = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(*tip);
        while let Some(digest) = current {
            if !visited.insert(digest) {
                return Err(RegistryError::CycleDetected(digest));
            }
            let layer = self
                .layers
                .get(&digest)
                .ok_or(RegistryError::NotFound(digest))?;
            digests.push(digest);
            current = layer.parent();
        }
        digests.reverse();
        Ok(digests)
    }
}

/// Outcome of publishing a layer into the map.
enum Inserted {
    New,
    Existing(Arc<Layer>),
}

/// Registry of immutable layers.
pub struct LayerRegistry {
    store: Arc<ContentStore>,
    state: RwLock<RegistryState>,
}

impl LayerRegistry {
    /// Create an empty registry on top of `store`.
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self {
            store,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Rebuild a registry from every layer record persisted in `store`,
    /// re-establishing all structural and content references.
    ///
    /// Layers whose parent is absent are kept as orphans; resolving a chain
    /// through them fails with [`RegistryError::BrokenChain`].
    pub fn open(store: Arc<ContentStore>) -> RegistryResult<Self> {
        let registry = Self::new(Arc::clone(&store));
        let mut loaded = Vec::new();
        for digest in store.digests_of_kind(ObjectKind::Layer) {
            let object = store.get_object(&digest)?;
            loaded.push(Layer::decode(&digest, &object)?);
        }

        let mut state = registry.write();
        for layer in &loaded {
            store.retain(&layer.digest())?;
            for content in layer.content_refs() {
                if let Err(e) = store.retain(&content) {
                    warn!(layer = %layer.digest().short_hex(), content = %content.short_hex(), error = %e, "layer references unavailable content");
                }
            }
        }
        let present: HashSet<Digest> = loaded.iter().map(Layer::digest).collect();
        for layer in loaded {
            let digest = layer.digest();
            if let Some(parent) = layer.parent() {
                if present.contains(&parent) {
                    store.retain(&parent)?;
                    state.children.entry(parent).or_default().insert(digest);
                } else {
                    warn!(layer = %digest.short_hex(), parent = %parent.short_hex(), "orphan layer: parent record is missing");
                }
            }
            state.layers.insert(digest, Arc::new(layer));
        }
        info!(layers = state.layers.len(), "opened layer registry");
        drop(state);
        Ok(registry)
    }

    /// The content store this registry persists into.
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    /// Register a layer and return its digest.
    ///
    /// On success the registry takes over the content references held by
    /// `entries` (one per live file record). Re-registering an identical
    /// layer returns the existing digest and releases the duplicate content
    /// references. On error the references stay with the caller.
    pub fn register(&self, parent: Option<Digest>, entries: Entries) -> RegistryResult<Digest> {
        let layer = Layer::new(parent, entries)?;
        let digest = layer.digest();
        if self.contains(&digest) {
            self.release_all(layer.content_refs());
            debug!(layer = %digest.short_hex(), "layer already registered");
            return Ok(digest);
        }
        self.publish(layer, false).map(|(digest, _)| digest)
    }

    /// Register a layer and lease the chain ending at it in one step, so the
    /// new layer is never observable without a holder. Ownership of content
    /// references follows [`register`](Self::register).
    pub fn register_leased(
        &self,
        parent: Option<Digest>,
        entries: Entries,
    ) -> RegistryResult<(Digest, ChainLease)> {
        let layer = Layer::new(parent, entries)?;
        let (digest, lease) = self.publish(layer, true)?;
        let lease = lease.ok_or(RegistryError::NotFound(digest))?;
        Ok((digest, lease))
    }

    fn publish(&self, layer: Layer, lease: bool) -> RegistryResult<(Digest, Option<ChainLease>)> {
        let digest = layer.digest();
        let parent = layer.parent();
        if let Some(parent) = parent {
            if !self.contains(&parent) {
                self.import(&parent)?;
            }
        }

        self.store.put_object(&layer.to_object()?)?;
        let entry_count = layer.len();
        match self.insert(layer, lease) {
            Ok((Inserted::New, lease)) => {
                info!(layer = %digest.short_hex(), parent = ?parent.map(|p| p.short_hex()), entries = entry_count, "registered layer");
                Ok((digest, lease))
            }
            Ok((Inserted::Existing(layer), lease)) => {
                self.release_all(layer.content_refs());
                self.release_all([digest]);
                debug!(layer = %digest.short_hex(), "layer already registered");
                Ok((digest, lease))
            }
            Err(e) => {
                self.release_all([digest]);
                Err(e)
            }
        }
    }

    /// Publish a layer whose registration reference is already held. Takes
    /// the parent custody reference under the write lock and, if asked,
    /// leases the chain ending at the layer before the lock is released.
    fn insert(&self, layer: Layer, lease: bool) -> RegistryResult<(Inserted, Option<ChainLease>)> {
        let digest = layer.digest();
        let mut state = self.write();

        let mut chain = match layer.parent() {
            Some(parent) if !state.layers.contains_key(&parent) => {
                return Err(RegistryError::NotFound(parent));
            }
            Some(parent) if lease => state.walk(&parent).map_err(|e| broken_chain(&digest, e))?,
            _ => Vec::new(),
        };
        chain.push(digest);

        let outcome = match state.layers.get(&digest) {
            Some(existing) => Inserted::Existing(Arc::clone(existing)),
            None => {
                if let Some(parent) = layer.parent() {
                    self.store.retain(&parent)?;
                    state.children.entry(parent).or_default().insert(digest);
                }
                state.layers.insert(digest, Arc::new(layer));
                Inserted::New
            }
        };

        let lease = if lease {
            for d in &chain {
                self.store.retain(d)?;
            }
            Some(ChainLease {
                chain: LayerChain::from_base_first(chain),
                store: Arc::clone(&self.store),
            })
        } else {
            None
        };
        Ok((outcome, lease))
    }

    /// Bring a layer known to the content store (or its fetcher) but not to
    /// the registry into the registry, together with any missing ancestors.
    fn import(&self, digest: &Digest) -> RegistryResult<Arc<Layer>> {
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(*digest);
        while let Some(current) = next {
            if self.contains(&current) {
                break;
            }
            if !seen.insert(current) {
                return Err(RegistryError::CycleDetected(current));
            }
            let object = self.store.get_object(&current).map_err(|e| match e {
                StoreError::NotFound(missing) => RegistryError::NotFound(missing),
                other => other.into(),
            })?;
            let layer = Layer::decode(&current, &object)?;
            next = layer.parent();
            pending.push(layer);
        }

        for layer in pending.into_iter().rev() {
            self.adopt(layer)?;
        }
        self.get(digest).ok_or(RegistryError::NotFound(*digest))
    }

    /// Take every reference a registered layer owns and publish it.
    fn adopt(&self, layer: Layer) -> RegistryResult<()> {
        let digest = layer.digest();
        let mut taken = Vec::new();
        for d in std::iter::once(digest).chain(layer.content_refs()) {
            match self.store.retain(&d) {
                Ok(_) => taken.push(d),
                Err(e) => {
                    self.release_all(taken);
                    return Err(e.into());
                }
            }
        }
        match self.insert(layer, false) {
            Ok((Inserted::New, _)) => {
                info!(layer = %digest.short_hex(), "imported layer");
                Ok(())
            }
            Ok((Inserted::Existing(_), _)) => {
                self.release_all(taken);
                Ok(())
            }
            Err(e) => {
                self.release_all(taken);
                Err(e)
            }
        }
    }

    /// Release references that are no longer owned by anyone. Failures mean
    /// the bookkeeping is already off; they are logged, not propagated.
    fn release_all(&self, digests: impl IntoIterator<Item = Digest>) {
        for digest in digests {
            if let Err(e) = self.store.release(&digest) {
                warn!(digest = %digest.short_hex(), error = %e, "failed to release reference");
            }
        }
    }

    /// Start building a layer on top of `parent`.
    pub fn builder(&self, parent: Option<Digest>) -> LayerBuilder<'_> {
        LayerBuilder {
            registry: self,
            parent,
            entries: Entries::new(),
        }
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Resolve the chain ending at `tip`, base first.
    ///
    /// Layers missing from the registry are imported from the content store
    /// (which may consult its fetcher). An ancestor that cannot be found
    /// anywhere fails with [`RegistryError::BrokenChain`].
    pub fn resolve_chain(&self, tip: &Digest) -> RegistryResult<LayerChain> {
        loop {
            let walked = self.read().walk(tip);
            match walked {
                Ok(digests) => return Ok(LayerChain::from_base_first(digests)),
                Err(RegistryError::NotFound(missing)) => {
                    self.import(&missing)
                        .map_err(|e| broken_chain(tip, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve the chain ending at `tip` and hold a reference to every layer
    /// in it until the returned lease is dropped. `None` leases the empty
    /// chain.
    pub fn lease(&self, tip: Option<Digest>) -> RegistryResult<ChainLease> {
        let Some(tip) = tip else {
            return Ok(self.empty_lease());
        };

        self.resolve_chain(&tip)?;
        let state = self.read();
        let digests = state.walk(&tip).map_err(|e| broken_chain(&tip, e))?;
        let mut taken = Vec::with_capacity(digests.len());
        for digest in &digests {
            match self.store.retain(digest) {
                Ok(_) => taken.push(*digest),
                Err(e) => {
                    drop(state);
                    self.release_all(taken);
                    return Err(e.into());
                }
            }
        }
        drop(state);
        debug!(tip = %tip.short_hex(), depth = digests.len(), "leased chain");
        Ok(ChainLease {
            chain: LayerChain::from_base_first(digests),
            store: Arc::clone(&self.store),
        })
    }

    /// A lease on the empty chain. Holds nothing.
    pub fn empty_lease(&self) -> ChainLease {
        ChainLease {
            chain: LayerChain::empty(),
            store: Arc::clone(&self.store),
        }
    }

    /// Retrieve a layer by digest.
    pub fn get(&self, digest: &Digest) -> Option<Arc<Layer>> {
        self.read().layers.get(digest).cloned()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.read().layers.contains_key(digest)
    }

    /// Direct children of a layer, sorted.
    pub fn children_of(&self, digest: &Digest) -> Vec<Digest> {
        self.read()
            .children
            .get(digest)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Layers without children, sorted.
    pub fn tips(&self) -> Vec<Digest> {
        let state = self.read();
        let mut tips: Vec<Digest> = state
            .layers
            .keys()
            .filter(|d| state.children.get(*d).map_or(true, BTreeSet::is_empty))
            .copied()
            .collect();
        tips.sort();
        tips
    }

    /// Every registered digest, sorted.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self.read().layers.keys().copied().collect();
        digests.sort();
        digests
    }

    pub fn len(&self) -> usize {
        self.read().layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().layers.is_empty()
    }

    /// Exclusive access for the garbage collector. Blocks registrations and
    /// leases until dropped.
    pub fn lock_for_collection(&self) -> CollectionGuard<'_> {
        CollectionGuard {
            state: self.write(),
            store: &self.store,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerRegistry")
            .field("layers", &self.len())
            .finish()
    }
}

/// Report a layer missing below `tip` as a broken chain.
fn broken_chain(tip: &Digest, err: RegistryError) -> RegistryError {
    match err {
        RegistryError::NotFound(missing) if missing != *tip => RegistryError::BrokenChain {
            tip: *tip,
            missing,
        },
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// A resolved chain whose layers are retained in the content store for as
/// long as the lease lives.
pub struct ChainLease {
    chain: LayerChain,
    store: Arc<ContentStore>,
}

impl ChainLease {
    pub fn chain(&self) -> &LayerChain {
        &self.chain
    }

    pub fn tip(&self) -> Option<Digest> {
        self.chain.tip()
    }
}

impl Drop for ChainLease {
    fn drop(&mut self) {
        for digest in self.chain.digests() {
            if let Err(e) = self.store.release(digest) {
                warn!(layer = %digest.short_hex(), error = %e, "failed to release chain lease");
            }
        }
    }
}

impl std::fmt::Debug for ChainLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainLease")
            .field("tip", &self.chain.tip())
            .field("depth", &self.chain.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Exclusive view of the registry held by the garbage collector.
pub struct CollectionGuard<'a> {
    state: RwLockWriteGuard<'a, RegistryState>,
    store: &'a ContentStore,
}

impl CollectionGuard<'_> {
    /// Every registered digest, sorted.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self.state.layers.keys().copied().collect();
        digests.sort();
        digests
    }

    pub fn get(&self, digest: &Digest) -> Option<Arc<Layer>> {
        self.state.layers.get(digest).cloned()
    }

    pub fn children_of(&self, digest: &Digest) -> Vec<Digest> {
        self.state
            .children
            .get(digest)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// References the registry itself owes a layer: registration plus one
    /// per registered child.
    pub fn structural_count(&self, digest: &Digest) -> u64 {
        1 + self.state.children.get(digest).map_or(0, |c| c.len() as u64)
    }

    /// References held on a layer beyond its structural count, e.g. leases.
    pub fn external_count(&self, digest: &Digest) -> u64 {
        self.store
            .ref_count(digest)
            .unwrap_or(0)
            .saturating_sub(self.structural_count(digest))
    }

    /// Unregister a layer and release every reference it owns: its content
    /// blobs, its custody reference on the parent and its own registration.
    /// Nothing is deleted until the store is swept.
    ///
    /// Children must be removed before their parent.
    pub fn remove(&mut self, digest: &Digest) -> RegistryResult<Arc<Layer>> {
        let layer = self
            .state
            .layers
            .remove(digest)
            .ok_or(RegistryError::NotFound(*digest))?;
        self.state.children.remove(digest);

        let mut owned: Vec<Digest> = layer.content_refs().collect();
        if let Some(parent) = layer.parent() {
            if let Some(siblings) = self.state.children.get_mut(&parent) {
                if siblings.remove(digest) {
                    owned.push(parent);
                }
                if siblings.is_empty() {
                    self.state.children.remove(&parent);
                }
            }
        }
        owned.push(*digest);

        for d in owned {
            if let Err(e) = self.store.release(&d) {
                warn!(layer = %digest.short_hex(), digest = %d.short_hex(), error = %e, "failed to release reference of removed layer");
            }
        }
        debug!(layer = %digest.short_hex(), "unregistered layer");
        Ok(layer)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a change set, storing file content as it goes.
///
/// The builder owns the content references it creates until [`build`]
/// hands them to the registry; dropping an unbuilt builder releases them.
///
/// [`build`]: LayerBuilder::build
pub struct LayerBuilder<'a> {
    registry: &'a LayerRegistry,
    parent: Option<Digest>,
    entries: Entries,
}

impl LayerBuilder<'_> {
    /// Record a new regular file.
    pub fn file(&mut self, path: &str, bytes: &[u8]) -> RegistryResult<&mut Self> {
        self.file_with_mode(path, bytes, EntryMode::Regular)
    }

    /// Record a new file with an explicit mode.
    pub fn file_with_mode(
        &mut self,
        path: &str,
        bytes: &[u8],
        mode: EntryMode,
    ) -> RegistryResult<&mut Self> {
        let path = LayerPath::parse(path)?;
        let content = self.registry.store.put(bytes)?;
        let meta = FileMeta::file(content, bytes.len() as u64).with_mode(mode);
        self.set(path, ChangeRecord::Added(meta));
        Ok(self)
    }

    /// Record a file that replaces one from a lower layer.
    pub fn modified(&mut self, path: &str, bytes: &[u8]) -> RegistryResult<&mut Self> {
        let path = LayerPath::parse(path)?;
        let content = self.registry.store.put(bytes)?;
        let meta = FileMeta::file(content, bytes.len() as u64);
        self.set(path, ChangeRecord::Modified(meta));
        Ok(self)
    }

    /// Record a symbolic link pointing at `target`.
    pub fn symlink(&mut self, path: &str, target: &str) -> RegistryResult<&mut Self> {
        self.file_with_mode(path, target.as_bytes(), EntryMode::Symlink)
    }

    /// Record an explicit directory.
    pub fn dir(&mut self, path: &str) -> RegistryResult<&mut Self> {
        let path = LayerPath::parse(path)?;
        self.set(path, ChangeRecord::Added(FileMeta::directory()));
        Ok(self)
    }

    /// Record a whiteout.
    pub fn whiteout(&mut self, path: &str) -> RegistryResult<&mut Self> {
        let path = LayerPath::parse(path)?;
        self.set(path, ChangeRecord::Deleted);
        Ok(self)
    }

    /// Records collected so far.
    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    /// Register the layer.
    pub fn build(mut self) -> RegistryResult<Digest> {
        let entries = std::mem::take(&mut self.entries);
        let refs: Vec<Digest> = entries.values().filter_map(ChangeRecord::content_ref).collect();
        match self.registry.register(self.parent, entries) {
            Ok(digest) => Ok(digest),
            Err(e) => {
                self.registry.release_all(refs);
                Err(e)
            }
        }
    }

    fn set(&mut self, path: LayerPath, record: ChangeRecord) {
        if let Some(previous) = self.entries.insert(path, record) {
            self.registry.release_all(previous.content_ref());
        }
    }
}

impl Drop for LayerBuilder<'_> {
    fn drop(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        self.registry
            .release_all(entries.values().filter_map(ChangeRecord::content_ref));
    }
}
