//! Immutable layers and layer chains.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use strata_store::{ObjectKind, StoredObject};
use strata_types::{Digest, LayerPath};

use crate::error::{RegistryError, RegistryResult};
use crate::record::ChangeRecord;

/// Change records keyed by normalized path. Iteration order places every
/// directory before its descendants.
pub type Entries = BTreeMap<LayerPath, ChangeRecord>;

/// The persisted form of a layer. The digest of its JSON encoding, hashed in
/// the layer domain, is the layer digest.
#[derive(Serialize)]
struct LayerRecordRef<'a> {
    parent: Option<Digest>,
    entries: &'a Entries,
}

#[derive(Deserialize)]
struct LayerRecord {
    parent: Option<Digest>,
    entries: Entries,
}

/// An immutable layer: a set of change records relative to an optional
/// parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layer {
    digest: Digest,
    parent: Option<Digest>,
    entries: Entries,
}

impl Layer {
    /// Build a layer and compute its digest.
    pub fn new(parent: Option<Digest>, entries: Entries) -> RegistryResult<Self> {
        let object = Self::encode(parent, &entries)?;
        Ok(Self {
            digest: object.compute_digest(),
            parent,
            entries,
        })
    }

    /// Canonical stored object for a layer. Entries are serialized in path
    /// order, so equal layers always encode to equal bytes.
    pub(crate) fn encode(parent: Option<Digest>, entries: &Entries) -> RegistryResult<StoredObject> {
        let record = LayerRecordRef { parent, entries };
        let data = serde_json::to_vec(&record)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;
        Ok(StoredObject::new(ObjectKind::Layer, data))
    }

    /// The stored object for this layer.
    pub fn to_object(&self) -> RegistryResult<StoredObject> {
        Self::encode(self.parent, &self.entries)
    }

    /// Decode a stored layer object and check it against `digest`.
    pub fn decode(digest: &Digest, object: &StoredObject) -> RegistryResult<Self> {
        object.expect_kind(digest, ObjectKind::Layer)?;
        object.verify(digest)?;
        let record: LayerRecord = serde_json::from_slice(&object.data)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;
        Ok(Self {
            digest: *digest,
            parent: record.parent,
            entries: record.entries,
        })
    }

    /// A layer under an arbitrary digest, for building states that
    /// registration can never produce.
    #[cfg(test)]
    pub(crate) fn with_digest(digest: Digest, parent: Option<Digest>, entries: Entries) -> Self {
        Self {
            digest,
            parent,
            entries,
        }
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn parent(&self) -> Option<Digest> {
        self.parent
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The record this layer holds for exactly `path`.
    pub fn record(&self, path: &str) -> Option<&ChangeRecord> {
        self.entries.get(path)
    }

    /// Records strictly beneath `dir`, in path order.
    pub fn descendants<'a>(
        &'a self,
        dir: &LayerPath,
    ) -> impl Iterator<Item = (&'a LayerPath, &'a ChangeRecord)> + 'a {
        descendants_of(&self.entries, dir)
    }

    /// Every content blob referenced by this layer, one entry per record.
    pub fn content_refs(&self) -> impl Iterator<Item = Digest> + '_ {
        self.entries.values().filter_map(ChangeRecord::content_ref)
    }

    /// Total bytes of content recorded by this layer.
    pub fn content_size(&self) -> u64 {
        self.entries
            .values()
            .filter_map(ChangeRecord::meta)
            .map(|meta| meta.size)
            .sum()
    }
}

/// Records of `entries` strictly beneath `dir`, in path order.
pub fn descendants_of<'a>(
    entries: &'a Entries,
    dir: &LayerPath,
) -> impl Iterator<Item = (&'a LayerPath, &'a ChangeRecord)> + 'a {
    let prefix = dir.descendant_prefix();
    let range = entries.range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded));
    range
        .take_while(move |(path, _)| path.as_str().starts_with(prefix.as_str()))
        .filter(|(path, _)| !path.is_root())
}

/// An ordered list of layer digests, base first.
///
/// Each layer's parent is the digest before it. A chain is only a list of
/// identifiers; layers themselves live in the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerChain(Vec<Digest>);

impl LayerChain {
    /// The empty chain: no image underneath.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_base_first(digests: Vec<Digest>) -> Self {
        Self(digests)
    }

    /// The topmost layer, if any.
    pub fn tip(&self) -> Option<Digest> {
        self.0.last().copied()
    }

    /// The bottom layer, if any.
    pub fn base(&self) -> Option<Digest> {
        self.0.first().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.0.contains(digest)
    }

    /// Digests base first.
    pub fn digests(&self) -> &[Digest] {
        &self.0
    }

    /// Digests tip first, the order of resolution.
    pub fn top_down(&self) -> impl Iterator<Item = &Digest> {
        self.0.iter().rev()
    }
}
