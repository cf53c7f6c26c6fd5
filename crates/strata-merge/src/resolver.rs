//! Path resolution across a stack of layers.
//!
//! A [`MergeView`] is the logical filesystem seen through a layer chain plus
//! an optional upper change set (the writable layer). Levels are consulted
//! top to base; the first level that says anything about a path decides:
//!
//! - an explicit live record is returned as is,
//! - an explicit whiteout hides the path and everything beneath it,
//! - a whiteout or a non-directory record on an ancestor masks the path,
//! - live records beneath the path make it an implicit directory.
//!
//! A whiteout in a level that also holds live records beneath it is an opaque
//! directory: it resolves as a directory containing only what that level and
//! the levels above it put there.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use strata_layer::{descendants_of, ChangeRecord, Entries, FileMeta, Layer, LayerChain, LayerRegistry, RegistryError};
use strata_types::{Digest, LayerPath};

use crate::error::{MergeError, MergeResult};

/// Where a resolved entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "digest")]
pub enum Source {
    /// The writable layer on top of the chain.
    Writable,
    /// An immutable layer of the chain.
    Layer(Digest),
    /// A directory implied by entries beneath it, or the root.
    Implicit,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Writable => f.write_str("writable"),
            Self::Layer(digest) => write!(f, "layer {}", digest.short_hex()),
            Self::Implicit => f.write_str("implicit"),
        }
    }
}

/// A visible entry of a logical view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedEntry {
    pub path: LayerPath,
    pub meta: FileMeta,
    pub source: Source,
}

impl ResolvedEntry {
    pub fn is_dir(&self) -> bool {
        self.meta.is_dir()
    }

    fn implicit_dir(path: &LayerPath) -> Self {
        Self {
            path: path.clone(),
            meta: FileMeta::directory().with_mtime(0),
            source: Source::Implicit,
        }
    }

    fn opaque_dir(path: &LayerPath, source: Source) -> Self {
        Self {
            path: path.clone(),
            meta: FileMeta::directory().with_mtime(0),
            source,
        }
    }
}

/// Outcome of a lookup. `Whiteout` and `Absent` are distinct internally and
/// both surface as [`MergeError::NotFound`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Found(ResolvedEntry),
    Whiteout,
    Absent,
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }
}

enum LevelEntries<'a> {
    Upper(&'a Entries),
    Layer(Arc<Layer>),
}

struct Level<'a> {
    source: Source,
    entries: LevelEntries<'a>,
}

impl Level<'_> {
    fn entries(&self) -> &Entries {
        match &self.entries {
            LevelEntries::Upper(entries) => entries,
            LevelEntries::Layer(layer) => layer.entries(),
        }
    }
}

/// A read-only snapshot of a chain plus an optional upper change set.
///
/// Building a view pins the chain's layers (`Arc<Layer>`), so later
/// registrations and collections do not affect it.
pub struct MergeView<'a> {
    /// Top first.
    levels: Vec<Level<'a>>,
}

impl<'a> MergeView<'a> {
    /// Snapshot `chain` from `registry`, with `upper` as the top level.
    pub fn new(
        registry: &LayerRegistry,
        chain: &LayerChain,
        upper: Option<&'a Entries>,
    ) -> MergeResult<Self> {
        let mut levels = Vec::with_capacity(chain.len() + 1);
        if let Some(upper) = upper {
            levels.push(Level {
                source: Source::Writable,
                entries: LevelEntries::Upper(upper),
            });
        }
        for digest in chain.top_down() {
            let layer = registry
                .get(digest)
                .ok_or(RegistryError::NotFound(*digest))?;
            levels.push(Level {
                source: Source::Layer(*digest),
                entries: LevelEntries::Layer(layer),
            });
        }
        Ok(Self { levels })
    }

    /// Number of levels, the upper change set included.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Resolve `path` to the entry a reader would see.
    pub fn resolve_path(&self, path: &LayerPath) -> MergeResult<ResolvedEntry> {
        match self.lookup(path) {
            Lookup::Found(entry) => Ok(entry),
            Lookup::Whiteout | Lookup::Absent => Err(MergeError::NotFound(path.clone())),
        }
    }

    /// Resolve `path`, distinguishing a whiteout from plain absence.
    pub fn lookup(&self, path: &LayerPath) -> Lookup {
        for level in &self.levels {
            let entries = level.entries();

            if let Some(record) = entries.get(path.as_str()) {
                return match record {
                    ChangeRecord::Added(meta) | ChangeRecord::Modified(meta) => {
                        Lookup::Found(ResolvedEntry {
                            path: path.clone(),
                            meta: meta.clone(),
                            source: level.source,
                        })
                    }
                    ChangeRecord::Deleted if has_live_descendants(entries, path) => {
                        Lookup::Found(ResolvedEntry::opaque_dir(path, level.source))
                    }
                    ChangeRecord::Deleted => Lookup::Whiteout,
                };
            }

            if let Some(masking) = masking_ancestor(entries, path) {
                if masking.is_whiteout() && has_live_descendants(entries, path) {
                    return Lookup::Found(ResolvedEntry::implicit_dir(path));
                }
                return Lookup::Whiteout;
            }

            if has_live_descendants(entries, path) {
                return Lookup::Found(ResolvedEntry::implicit_dir(path));
            }
        }

        if path.is_root() {
            return Lookup::Found(ResolvedEntry::implicit_dir(path));
        }
        Lookup::Absent
    }

    /// Names of the visible direct children of `dir`. A missing, masked or
    /// non-directory `dir` lists as empty.
    pub fn list_dir(&self, dir: &LayerPath) -> MergeResult<BTreeSet<String>> {
        let mut visible = BTreeSet::new();
        match self.lookup(dir) {
            Lookup::Found(entry) if entry.is_dir() => {}
            _ => return Ok(visible),
        }

        let mut candidates = BTreeSet::new();
        for level in &self.levels {
            for (path, _) in descendants_of(level.entries(), dir) {
                if let Some(name) = dir.child_name_toward(path.as_str()) {
                    candidates.insert(name);
                }
            }
        }

        for name in candidates {
            let child = dir.join(name)?;
            if self.lookup(&child).is_found() {
                visible.insert(name.to_string());
            }
        }
        Ok(visible)
    }

    /// Resolve `path` and read its content from `registry`'s store.
    pub fn read(&self, registry: &LayerRegistry, path: &LayerPath) -> MergeResult<Vec<u8>> {
        let entry = self.resolve_path(path)?;
        if entry.is_dir() {
            return Err(MergeError::IsADirectory(path.clone()));
        }
        match entry.meta.content_ref() {
            Some(content) => Ok(registry.store().get(&content)?),
            None => Ok(Vec::new()),
        }
    }
}

/// The nearest-first ancestor record of `path` in `entries` that hides lower
/// levels: a whiteout, or a live record that is not a directory.
fn masking_ancestor<'e>(entries: &'e Entries, path: &LayerPath) -> Option<&'e ChangeRecord> {
    path.ancestors()
        .filter_map(|ancestor| entries.get(ancestor))
        .find(|record| !record.is_dir())
}

fn has_live_descendants(entries: &Entries, path: &LayerPath) -> bool {
    descendants_of(entries, path).any(|(_, record)| !record.is_whiteout())
}

// ---------------------------------------------------------------------------
// One-shot helpers
// ---------------------------------------------------------------------------

/// Resolve one path through `chain` and an optional upper change set.
pub fn resolve_path(
    registry: &LayerRegistry,
    chain: &LayerChain,
    upper: Option<&Entries>,
    path: &LayerPath,
) -> MergeResult<ResolvedEntry> {
    MergeView::new(registry, chain, upper)?.resolve_path(path)
}

/// List the visible children of `dir`.
pub fn list_dir(
    registry: &LayerRegistry,
    chain: &LayerChain,
    upper: Option<&Entries>,
    dir: &LayerPath,
) -> MergeResult<BTreeSet<String>> {
    MergeView::new(registry, chain, upper)?.list_dir(dir)
}

/// Resolve and read one file.
pub fn read(
    registry: &LayerRegistry,
    chain: &LayerChain,
    upper: Option<&Entries>,
    path: &LayerPath,
) -> MergeResult<Vec<u8>> {
    MergeView::new(registry, chain, upper)?.read(registry, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_store::ContentStore;

    fn p(path: &str) -> LayerPath {
        LayerPath::parse(path).unwrap()
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    fn registry() -> LayerRegistry {
        LayerRegistry::new(Arc::new(ContentStore::in_memory()))
    }

    /// Builds a layer from `(path, Some(bytes))` files and `(path, None)`
    /// whiteouts.
    fn layer(registry: &LayerRegistry, parent: Option<Digest>, records: &[(&str, Option<&[u8]>)]) -> Digest {
        let mut builder = registry.builder(parent);
        for (path, bytes) in records {
            match bytes {
                Some(bytes) => builder.file(path, bytes).unwrap(),
                None => builder.whiteout(path).unwrap(),
            };
        }
        builder.build().unwrap()
    }

    fn upper_with(store: &ContentStore, records: &[(&str, Option<&[u8]>)]) -> Entries {
        let mut entries = Entries::new();
        for (path, bytes) in records {
            let record = match bytes {
                Some(bytes) => {
                    let content = store.put(bytes).unwrap();
                    ChangeRecord::Added(FileMeta::file(content, bytes.len() as u64))
                }
                None => ChangeRecord::Deleted,
            };
            entries.insert(p(path), record);
        }
        entries
    }

    // -----------------------------------------------------------------------
    // Masking
    // -----------------------------------------------------------------------

    #[test]
    fn topmost_record_wins() {
        let registry = registry();
        let base = layer(&registry, None, &[("/f", Some(b"A"))]);
        let top = layer(&registry, Some(base), &[("/f", Some(b"B"))]);
        let chain = registry.resolve_chain(&top).unwrap();

        let view = MergeView::new(&registry, &chain, None).unwrap();
        let entry = view.resolve_path(&p("/f")).unwrap();
        assert_eq!(entry.source, Source::Layer(top));
        assert_eq!(view.read(&registry, &p("/f")).unwrap(), b"B");
    }

    #[test]
    fn whiteout_masks_lower_file() {
        let registry = registry();
        let base = layer(&registry, None, &[("/f", Some(b"A"))]);
        let top = layer(&registry, Some(base), &[("/f", None)]);
        let chain = registry.resolve_chain(&top).unwrap();

        let err = resolve_path(&registry, &chain, None, &p("/f")).unwrap_err();
        assert!(matches!(err, MergeError::NotFound(_)));

        let view = MergeView::new(&registry, &chain, None).unwrap();
        assert_eq!(view.lookup(&p("/f")), Lookup::Whiteout);
        assert_eq!(view.lookup(&p("/never")), Lookup::Absent);
    }

    #[test]
    fn deep_whiteout_masks_whole_subtree() {
        let registry = registry();
        let base = layer(&registry, None, &[("/a/b", Some(b"X"))]);
        let top = layer(&registry, Some(base), &[("/a", None)]);
        let chain = registry.resolve_chain(&top).unwrap();

        assert!(list_dir(&registry, &chain, None, &p("/a")).unwrap().is_empty());
        let err = resolve_path(&registry, &chain, None, &p("/a/b")).unwrap_err();
        assert!(matches!(err, MergeError::NotFound(_)));
        assert!(list_dir(&registry, &chain, None, &LayerPath::root()).unwrap().is_empty());
    }

    #[test]
    fn file_ancestor_masks_lower_subtree() {
        let registry = registry();
        let base = layer(&registry, None, &[("/a/b", Some(b"X"))]);
        let top = layer(&registry, Some(base), &[("/a", Some(b"now a file"))]);
        let chain = registry.resolve_chain(&top).unwrap();

        let view = MergeView::new(&registry, &chain, None).unwrap();
        assert!(!view.resolve_path(&p("/a")).unwrap().is_dir());
        assert_eq!(view.lookup(&p("/a/b")), Lookup::Whiteout);
        assert!(view.list_dir(&p("/a")).unwrap().is_empty());
    }

    #[test]
    fn whiteout_in_middle_layer_is_overridden_above() {
        let registry = registry();
        let l0 = layer(&registry, None, &[("/f", Some(b"one"))]);
        let l1 = layer(&registry, Some(l0), &[("/f", None)]);
        let l2 = layer(&registry, Some(l1), &[("/f", Some(b"three"))]);
        let chain = registry.resolve_chain(&l2).unwrap();
        assert_eq!(read(&registry, &chain, None, &p("/f")).unwrap(), b"three");
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    #[test]
    fn root_always_resolves_as_directory() {
        let registry = registry();
        let view = MergeView::new(&registry, &LayerChain::empty(), None).unwrap();
        let root = view.resolve_path(&LayerPath::root()).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.source, Source::Implicit);
        assert!(view.list_dir(&LayerPath::root()).unwrap().is_empty());
    }

    #[test]
    fn implicit_directories_from_descendants() {
        let registry = registry();
        let base = layer(&registry, None, &[("/usr/lib/libc.so", Some(b"elf"))]);
        let chain = registry.resolve_chain(&base).unwrap();
        let view = MergeView::new(&registry, &chain, None).unwrap();

        assert!(view.resolve_path(&p("/usr")).unwrap().is_dir());
        assert!(view.resolve_path(&p("/usr/lib")).unwrap().is_dir());
        assert_eq!(names(&view.list_dir(&p("/usr")).unwrap()), vec!["lib"]);
        assert!(matches!(
            view.read(&registry, &p("/usr/lib")),
            Err(MergeError::IsADirectory(_))
        ));
    }

    #[test]
    fn list_dir_of_file_or_missing_is_empty() {
        let registry = registry();
        let base = layer(&registry, None, &[("/f", Some(b"x"))]);
        let chain = registry.resolve_chain(&base).unwrap();
        let view = MergeView::new(&registry, &chain, None).unwrap();
        assert!(view.list_dir(&p("/f")).unwrap().is_empty());
        assert!(view.list_dir(&p("/missing")).unwrap().is_empty());
    }

    #[test]
    fn sibling_prefix_is_not_a_child() {
        let registry = registry();
        let base = layer(
            &registry,
            None,
            &[("/app/bin", Some(b"1")), ("/app-data/x", Some(b"2"))],
        );
        let chain = registry.resolve_chain(&base).unwrap();
        let view = MergeView::new(&registry, &chain, None).unwrap();
        assert_eq!(names(&view.list_dir(&p("/app")).unwrap()), vec!["bin"]);
        assert_eq!(
            names(&view.list_dir(&LayerPath::root()).unwrap()),
            vec!["app", "app-data"]
        );
    }

    #[test]
    fn opaque_directory_hides_lower_contents() {
        let registry = registry();
        let store = Arc::clone(registry.store());
        let base = layer(&registry, None, &[("/d/old", Some(b"old"))]);
        let chain = registry.resolve_chain(&base).unwrap();
        let upper = upper_with(&store, &[("/d", None), ("/d/new", Some(b"new"))]);

        let view = MergeView::new(&registry, &chain, Some(&upper)).unwrap();
        let dir = view.resolve_path(&p("/d")).unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.source, Source::Writable);
        assert_eq!(names(&view.list_dir(&p("/d")).unwrap()), vec!["new"]);
        assert_eq!(view.lookup(&p("/d/old")), Lookup::Whiteout);
    }

    // -----------------------------------------------------------------------
    // Upper change set
    // -----------------------------------------------------------------------

    #[test]
    fn layered_image_scenario() {
        let registry = registry();
        let store = Arc::clone(registry.store());
        let l0 = layer(&registry, None, &[("/app/bin", Some(b"v1"))]);
        let l1 = layer(
            &registry,
            Some(l0),
            &[("/app/bin", Some(b"v2")), ("/app/tmp", None)],
        );
        let chain = registry.resolve_chain(&l1).unwrap();
        let upper = upper_with(&store, &[("/app/conf", Some(b"x"))]);

        let view = MergeView::new(&registry, &chain, Some(&upper)).unwrap();
        assert_eq!(view.read(&registry, &p("/app/bin")).unwrap(), b"v2");
        assert_eq!(view.read(&registry, &p("/app/conf")).unwrap(), b"x");
        assert_eq!(
            names(&view.list_dir(&p("/app")).unwrap()),
            vec!["bin", "conf"]
        );
        assert_eq!(view.depth(), 3);
    }

    #[test]
    fn upper_whiteout_masks_chain() {
        let registry = registry();
        let store = Arc::clone(registry.store());
        let base = layer(&registry, None, &[("/etc/passwd", Some(b"root"))]);
        let chain = registry.resolve_chain(&base).unwrap();
        let upper = upper_with(&store, &[("/etc", None)]);

        let view = MergeView::new(&registry, &chain, Some(&upper)).unwrap();
        assert_eq!(view.lookup(&p("/etc")), Lookup::Whiteout);
        assert_eq!(view.lookup(&p("/etc/passwd")), Lookup::Whiteout);

        // The chain alone is unchanged.
        let lower = MergeView::new(&registry, &chain, None).unwrap();
        assert!(lower.lookup(&p("/etc/passwd")).is_found());
    }

    #[test]
    fn view_over_unregistered_layer_fails() {
        let registry = registry();
        let base = layer(&registry, None, &[("/f", Some(b"x"))]);
        let chain = registry.resolve_chain(&base).unwrap();
        registry.lock_for_collection().remove(&base).unwrap();
        let err = MergeView::new(&registry, &chain, None).err().unwrap();
        assert!(matches!(err, MergeError::Registry(RegistryError::NotFound(_))));
    }
}
