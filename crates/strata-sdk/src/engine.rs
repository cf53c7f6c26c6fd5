use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use strata_gc::{GarbageCollector, GcReport, PeriodicCollector};
use strata_layer::{Entries, Layer, LayerBuilder, LayerChain, LayerRegistry, RegistryError};
use strata_merge::{materialize, MaterializeStats, MergeResult, MergeView, ResolvedEntry};
use strata_store::{BlobFetcher, ContentStore, FsBackend, InMemoryBackend, StoreStats};
use strata_types::{Digest, LayerPath};
use strata_writable::WritableLayer;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::import::{import_dir, ImportStats};
use crate::refs::{RefStore, REFS_FILE};

/// Shortest digest prefix accepted by [`Engine::resolve_target`].
pub const MIN_PREFIX_LEN: usize = 4;

/// Counters across the engine's components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub layers: usize,
    pub tips: usize,
    pub refs: usize,
    pub objects: usize,
    pub blobs: usize,
    pub bytes: u64,
    pub unreferenced: usize,
}

/// High-level Strata API: one handle over the content store, the layer
/// registry, named refs and the collector.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<LayerRegistry>,
    refs: Arc<RefStore>,
}

impl Engine {
    /// Open an engine as described by `config`. A configured root is created
    /// if needed and its layers and refs are loaded.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        Self::open_with_fetcher(config, None)
    }

    /// Like [`open`](Self::open), with a fetcher for objects that are not
    /// present locally.
    pub fn open_with_fetcher(
        config: EngineConfig,
        fetcher: Option<Arc<dyn BlobFetcher>>,
    ) -> EngineResult<Self> {
        let store_config = config.store.to_store_config();
        let (store, refs) = match &config.root {
            Some(root) => {
                let mut backend = FsBackend::open(root)?;
                if !config.store.sync_writes {
                    backend = backend.without_sync();
                }
                let store = ContentStore::open(Arc::new(backend), store_config)?;
                (store, RefStore::open(root.join(REFS_FILE))?)
            }
            None => (
                ContentStore::new(Arc::new(InMemoryBackend::new()), store_config),
                RefStore::in_memory(),
            ),
        };
        let store = match fetcher {
            Some(fetcher) => store.with_fetcher(fetcher),
            None => store,
        };
        let registry = LayerRegistry::open(Arc::new(store))?;

        info!(root = ?config.root, layers = registry.len(), refs = refs.len(), "opened engine");
        Ok(Self {
            config,
            registry: Arc::new(registry),
            refs: Arc::new(refs),
        })
    }

    /// A throwaway engine with default settings and no persistence.
    pub fn in_memory() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: Arc::new(LayerRegistry::new(Arc::new(ContentStore::in_memory()))),
            refs: Arc::new(RefStore::in_memory()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        self.registry.store()
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    pub fn refs(&self) -> &Arc<RefStore> {
        &self.refs
    }

    // ---- Layers ----

    pub fn builder(&self, parent: Option<Digest>) -> LayerBuilder<'_> {
        self.registry.builder(parent)
    }

    /// Register a change set whose content references the caller holds.
    pub fn register(&self, parent: Option<Digest>, entries: Entries) -> EngineResult<Digest> {
        Ok(self.registry.register(parent, entries)?)
    }

    pub fn import_dir(
        &self,
        parent: Option<Digest>,
        dir: &Path,
    ) -> EngineResult<(Digest, ImportStats)> {
        import_dir(&self.registry, parent, dir)
    }

    /// Resolve the chain ending at `tip`, importing missing layers from the
    /// store or fetcher.
    pub fn chain(&self, tip: &Digest) -> EngineResult<LayerChain> {
        Ok(self.registry.resolve_chain(tip)?)
    }

    pub fn layer(&self, digest: &Digest) -> EngineResult<Arc<Layer>> {
        self.chain(digest)?;
        self.registry
            .get(digest)
            .ok_or_else(|| RegistryError::NotFound(*digest).into())
    }

    /// Turn a ref name, a full hex digest or a unique digest prefix into a
    /// layer digest.
    pub fn resolve_target(&self, target: &str) -> EngineResult<Digest> {
        if let Some(digest) = self.refs.get(target) {
            return Ok(digest);
        }
        if let Ok(digest) = Digest::from_hex(target) {
            self.chain(&digest)?;
            return Ok(digest);
        }
        if target.len() >= MIN_PREFIX_LEN && target.chars().all(|c| c.is_ascii_hexdigit()) {
            let prefix = target.to_ascii_lowercase();
            let matches: Vec<Digest> = self
                .registry
                .digests()
                .into_iter()
                .filter(|d| d.to_hex().starts_with(&prefix))
                .collect();
            return match matches.as_slice() {
                [digest] => Ok(*digest),
                [] => Err(EngineError::UnknownTarget(target.to_string())),
                _ => Err(EngineError::AmbiguousTarget {
                    prefix: target.to_string(),
                    count: matches.len(),
                }),
            };
        }
        Err(EngineError::UnknownTarget(target.to_string()))
    }

    // ---- Views ----

    pub fn resolve_path(&self, tip: Option<Digest>, path: &str) -> EngineResult<ResolvedEntry> {
        let path = LayerPath::parse(path)?;
        self.with_view(tip, |view| view.resolve_path(&path))
    }

    pub fn list_dir(&self, tip: Option<Digest>, dir: &str) -> EngineResult<BTreeSet<String>> {
        let dir = LayerPath::parse(dir)?;
        self.with_view(tip, |view| view.list_dir(&dir))
    }

    pub fn read(&self, tip: Option<Digest>, path: &str) -> EngineResult<Vec<u8>> {
        let path = LayerPath::parse(path)?;
        self.with_view(tip, |view| view.read(&self.registry, &path))
    }

    pub fn export(&self, tip: Option<Digest>) -> EngineResult<Vec<ResolvedEntry>> {
        self.with_view(tip, |view| view.export())
    }

    /// Write the view of `tip` into `dest` on the host filesystem.
    pub fn materialize(&self, tip: Option<Digest>, dest: &Path) -> EngineResult<MaterializeStats> {
        self.with_view(tip, |view| materialize(view, &self.registry, dest))
    }

    /// Run `f` against the view of `tip` while its chain is leased.
    fn with_view<T>(
        &self,
        tip: Option<Digest>,
        f: impl FnOnce(&MergeView<'_>) -> MergeResult<T>,
    ) -> EngineResult<T> {
        let lease = self.registry.lease(tip)?;
        let view = MergeView::new(&self.registry, lease.chain(), None)?;
        Ok(f(&view)?)
    }

    // ---- Writable layers ----

    /// Start a writable layer on top of `base`.
    pub fn create_writable(&self, base: Option<Digest>) -> EngineResult<Arc<WritableLayer>> {
        Ok(Arc::new(WritableLayer::new(Arc::clone(&self.registry), base)?))
    }

    // ---- Refs ----

    /// Point `name` at `digest`, which must resolve to a complete chain.
    pub fn tag(&self, name: &str, digest: &Digest) -> EngineResult<Option<Digest>> {
        self.chain(digest)?;
        self.refs.set(name, *digest)
    }

    pub fn untag(&self, name: &str) -> EngineResult<Digest> {
        self.refs.remove(name)
    }

    pub fn tags(&self) -> Vec<(String, Digest)> {
        self.refs.list()
    }

    // ---- Collection ----

    pub fn collector(&self) -> GarbageCollector {
        GarbageCollector::new(Arc::clone(&self.registry))
    }

    /// Collect everything not reachable from a ref or a live lease.
    pub fn gc(&self) -> EngineResult<GcReport> {
        self.gc_with_roots(&[])
    }

    /// Like [`gc`](Self::gc), with extra roots.
    pub fn gc_with_roots(&self, extra: &[Digest]) -> EngineResult<GcReport> {
        let mut roots = self.refs.roots();
        roots.extend_from_slice(extra);
        Ok(self.collector().collect(&roots)?)
    }

    /// Layers the next [`gc`](Self::gc) would unregister.
    pub fn unreachable(&self) -> Vec<Digest> {
        self.collector().unreachable(&self.refs.roots())
    }

    /// Start background collection with the configured interval, rooted at
    /// the refs. Returns `None` when disabled. Must be called inside a tokio
    /// runtime.
    pub fn spawn_collector(&self) -> Option<PeriodicCollector> {
        if !self.config.gc.enabled {
            return None;
        }
        let refs = Arc::clone(&self.refs);
        Some(PeriodicCollector::spawn(
            self.collector(),
            self.config.gc.interval(),
            Arc::new(move || refs.roots()),
        ))
    }

    pub fn stats(&self) -> EngineStats {
        let store: StoreStats = self.store().stats();
        EngineStats {
            layers: self.registry.len(),
            tips: self.registry.tips().len(),
            refs: self.refs.len(),
            objects: store.objects,
            blobs: store.blobs,
            bytes: store.bytes,
            unreferenced: store.unreferenced,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.config.root)
            .field("layers", &self.registry.len())
            .field("refs", &self.refs.len())
            .finish()
    }
}
