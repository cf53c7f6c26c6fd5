//! Mark-and-release collection over the layer registry.
//!
//! A layer is live when it is reachable by parent links from a named root or
//! from a layer someone holds a reference on (a chain lease, an in-flight
//! read). Everything else is unregistered, leaves first, which releases the
//! references it owned. The content store then sweeps every object whose
//! count reached zero.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_layer::{CollectionGuard, LayerRegistry};
use strata_store::ObjectKind;
use strata_types::Digest;
use tracing::{debug, info, warn};

use crate::error::GcResult;

/// Collector settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run the periodic collector at all.
    pub enabled: bool,
    /// Seconds between periodic collections.
    pub interval_secs: u64,
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

/// Result of one collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    /// Layers unregistered, deepest first.
    pub unregistered: Vec<Digest>,
    /// Layers kept alive by roots or outstanding references.
    pub layers_live: usize,
    /// Layer objects deleted from the store.
    pub layers_reclaimed: usize,
    /// Blobs deleted from the store.
    pub blobs_reclaimed: usize,
    pub bytes_reclaimed: u64,
    /// Objects whose deletion failed; retried on the next collection.
    pub failed: usize,
}

impl GcReport {
    /// Total objects deleted.
    pub fn reclaimed_count(&self) -> usize {
        self.layers_reclaimed + self.blobs_reclaimed
    }
}

/// Collects layers unreachable from a set of roots.
#[derive(Clone, Debug)]
pub struct GarbageCollector {
    registry: Arc<LayerRegistry>,
}

impl GarbageCollector {
    pub fn new(registry: Arc<LayerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    /// Reclaim every layer not reachable from `roots` or from a retained
    /// layer, then sweep the store. Unknown roots are skipped.
    pub fn collect(&self, roots: &[Digest]) -> GcResult<GcReport> {
        let mut report = GcReport::default();
        {
            let mut guard = self.registry.lock_for_collection();
            let live = live_set(&guard, roots);
            report.layers_live = live.len();

            let doomed = deepest_first(&guard, &live);
            for digest in &doomed {
                guard.remove(digest)?;
            }
            report.unregistered = doomed;
        }

        let sweep = self.registry.store().sweep()?;
        report.layers_reclaimed = sweep.count(ObjectKind::Layer);
        report.blobs_reclaimed = sweep.count(ObjectKind::Blob);
        report.bytes_reclaimed = sweep.bytes;
        report.failed = sweep.failed;

        info!(
            live = report.layers_live,
            unregistered = report.unregistered.len(),
            layers = report.layers_reclaimed,
            blobs = report.blobs_reclaimed,
            bytes = report.bytes_reclaimed,
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Layers a collection with `roots` would unregister, without changing
    /// anything.
    pub fn unreachable(&self, roots: &[Digest]) -> Vec<Digest> {
        let guard = self.registry.lock_for_collection();
        let live = live_set(&guard, roots);
        deepest_first(&guard, &live)
    }
}

/// Collect with a one-off collector.
pub fn collect(registry: &Arc<LayerRegistry>, roots: &[Digest]) -> GcResult<GcReport> {
    GarbageCollector::new(Arc::clone(registry)).collect(roots)
}

/// Parent closure of the known roots and every externally retained layer.
fn live_set(guard: &CollectionGuard<'_>, roots: &[Digest]) -> HashSet<Digest> {
    let mut seeds = Vec::new();
    for root in roots {
        if guard.get(root).is_some() {
            seeds.push(*root);
        } else {
            warn!(root = %root.short_hex(), "skipping unknown root");
        }
    }
    for digest in guard.digests() {
        let external = guard.external_count(&digest);
        if external > 0 {
            debug!(layer = %digest.short_hex(), refs = external, "layer retained");
            seeds.push(digest);
        }
    }

    let mut live = HashSet::new();
    for seed in seeds {
        let mut next = Some(seed);
        while let Some(digest) = next {
            if !live.insert(digest) {
                break;
            }
            next = guard.get(&digest).and_then(|layer| layer.parent());
        }
    }
    live
}

/// Registered layers outside `live`, children before parents.
fn deepest_first(guard: &CollectionGuard<'_>, live: &HashSet<Digest>) -> Vec<Digest> {
    let mut doomed: Vec<(usize, Digest)> = guard
        .digests()
        .into_iter()
        .filter(|digest| !live.contains(digest))
        .map(|digest| (depth(guard, &digest), digest))
        .collect();
    doomed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    doomed.into_iter().map(|(_, digest)| digest).collect()
}

fn depth(guard: &CollectionGuard<'_>, digest: &Digest) -> usize {
    let mut depth = 0;
    let mut next = guard.get(digest).and_then(|layer| layer.parent());
    while let Some(parent) = next {
        depth += 1;
        next = guard.get(&parent).and_then(|layer| layer.parent());
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::{ContentStore, StoredObject};

    fn registry() -> Arc<LayerRegistry> {
        Arc::new(LayerRegistry::new(Arc::new(ContentStore::in_memory())))
    }

    fn layer(registry: &LayerRegistry, parent: Option<Digest>, path: &str, data: &[u8]) -> Digest {
        let mut builder = registry.builder(parent);
        builder.file(path, data).unwrap();
        builder.build().unwrap()
    }

    fn blob(data: &[u8]) -> Digest {
        StoredObject::blob(data.to_vec()).compute_digest()
    }

    // -----------------------------------------------------------------------
    // Reachability
    // -----------------------------------------------------------------------

    #[test]
    fn unreachable_layers_are_reclaimed() {
        let registry = registry();
        let base = layer(&registry, None, "/app/bin", b"v1");
        let top = layer(&registry, Some(base), "/app/bin", b"v2");
        let stray = layer(&registry, None, "/stray", b"zzz");

        let report = collect(&registry, &[top]).unwrap();

        assert_eq!(report.unregistered, vec![stray]);
        assert_eq!(report.layers_live, 2);
        assert_eq!(report.layers_reclaimed, 1);
        assert_eq!(report.blobs_reclaimed, 1);
        assert_eq!(report.reclaimed_count(), 2);
        assert!(registry.contains(&base));
        assert!(registry.contains(&top));
        assert!(!registry.contains(&stray));

        let store = registry.store();
        assert!(!store.exists(&stray));
        assert!(!store.exists(&blob(b"zzz")));
        assert!(store.exists(&blob(b"v1")));
    }

    #[test]
    fn children_are_removed_before_parents() {
        let registry = registry();
        let l0 = layer(&registry, None, "/a", b"0");
        let l1 = layer(&registry, Some(l0), "/b", b"1");
        let l2 = layer(&registry, Some(l1), "/c", b"2");

        let report = collect(&registry, &[]).unwrap();

        assert_eq!(report.unregistered, vec![l2, l1, l0]);
        assert_eq!(report.layers_reclaimed, 3);
        assert_eq!(report.blobs_reclaimed, 3);
        assert!(registry.is_empty());
        assert_eq!(registry.store().stats().objects, 0);
    }

    #[test]
    fn leased_layers_survive() {
        let registry = registry();
        let base = layer(&registry, None, "/app/bin", b"v1");
        let top = layer(&registry, Some(base), "/app/conf", b"c");

        let lease = registry.lease(Some(top)).unwrap();
        let report = collect(&registry, &[]).unwrap();
        assert_eq!(report.reclaimed_count(), 0);
        assert!(registry.contains(&base));
        assert!(registry.contains(&top));

        drop(lease);
        let report = collect(&registry, &[]).unwrap();
        assert_eq!(report.layers_reclaimed, 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn lease_on_parent_keeps_only_the_parent() {
        let registry = registry();
        let base = layer(&registry, None, "/a", b"a");
        let top = layer(&registry, Some(base), "/b", b"b");

        let _lease = registry.lease(Some(base)).unwrap();
        let report = collect(&registry, &[]).unwrap();

        assert_eq!(report.unregistered, vec![top]);
        assert!(registry.contains(&base));
        assert_eq!(registry.store().ref_count(&base), Some(2));
    }

    #[test]
    fn shared_blobs_outlive_one_owner() {
        let registry = registry();
        let kept = layer(&registry, None, "/lib/libc.so", b"shared");
        let dropped = layer(&registry, None, "/usr/lib/libc.so", b"shared");
        assert_eq!(registry.store().ref_count(&blob(b"shared")), Some(2));

        let report = collect(&registry, &[kept]).unwrap();

        assert_eq!(report.unregistered, vec![dropped]);
        assert_eq!(report.blobs_reclaimed, 0);
        assert_eq!(registry.store().ref_count(&blob(b"shared")), Some(1));
    }

    // -----------------------------------------------------------------------
    // Edge cases
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_roots_are_skipped() {
        let registry = registry();
        let base = layer(&registry, None, "/a", b"a");
        let report = collect(&registry, &[Digest::from_bytes(b"nope"), base]).unwrap();
        assert_eq!(report.reclaimed_count(), 0);
        assert!(registry.contains(&base));
    }

    #[test]
    fn second_collection_is_a_no_op() {
        let registry = registry();
        layer(&registry, None, "/a", b"a");
        collect(&registry, &[]).unwrap();
        let report = collect(&registry, &[]).unwrap();
        assert_eq!(report, GcReport::default());
    }

    #[test]
    fn loose_unreferenced_blobs_are_swept() {
        let registry = registry();
        let store = registry.store();
        let loose = store.put(b"loose").unwrap();
        store.release(&loose).unwrap();

        let report = collect(&registry, &[]).unwrap();
        assert_eq!(report.blobs_reclaimed, 1);
        assert!(!store.exists(&loose));
    }

    #[test]
    fn unreachable_is_a_dry_run() {
        let registry = registry();
        let keep = layer(&registry, None, "/a", b"a");
        let stray = layer(&registry, None, "/b", b"b");

        let collector = GarbageCollector::new(Arc::clone(&registry));
        assert_eq!(collector.unreachable(&[keep]), vec![stray]);
        assert!(registry.contains(&stray));
    }

    #[test]
    fn default_config() {
        let config = GcConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(300));
        let zero = GcConfig {
            interval_secs: 0,
            ..GcConfig::default()
        };
        assert_eq!(zero.interval(), Duration::from_secs(1));
    }
}
