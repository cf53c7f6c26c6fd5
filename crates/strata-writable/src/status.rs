//! Summaries of a writable layer's pending changes.

use serde::{Deserialize, Serialize};
use strata_layer::{ChangeRecord, Entries};
use strata_types::LayerPath;

/// Pending changes of a writable layer, grouped by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Paths that did not exist below the layer.
    pub added: Vec<LayerPath>,
    /// Paths copied up from a lower layer and changed.
    pub modified: Vec<LayerPath>,
    /// Whiteouts.
    pub deleted: Vec<LayerPath>,
    /// Bytes of content written by the layer.
    pub bytes: u64,
}

impl ChangeSummary {
    pub fn from_entries(entries: &Entries) -> Self {
        let mut summary = Self::default();
        for (path, record) in entries {
            match record {
                ChangeRecord::Added(meta) => {
                    summary.added.push(path.clone());
                    summary.bytes += meta.size;
                }
                ChangeRecord::Modified(meta) => {
                    summary.modified.push(path.clone());
                    summary.bytes += meta.size;
                }
                ChangeRecord::Deleted => summary.deleted.push(path.clone()),
            }
        }
        summary
    }

    /// Returns `true` if there are no changes of any kind.
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Total number of changed paths.
    pub fn total_entries(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_layer::FileMeta;
    use strata_types::Digest;

    #[test]
    fn empty_summary_is_clean() {
        let summary = ChangeSummary::from_entries(&Entries::new());
        assert!(summary.is_clean());
        assert_eq!(summary.total_entries(), 0);
    }

    #[test]
    fn summary_groups_by_kind() {
        let mut entries = Entries::new();
        let meta = FileMeta::file(Digest::from_bytes(b"x"), 3);
        entries.insert(LayerPath::parse("/new").unwrap(), ChangeRecord::Added(meta.clone()));
        entries.insert(LayerPath::parse("/changed").unwrap(), ChangeRecord::Modified(meta));
        entries.insert(LayerPath::parse("/gone").unwrap(), ChangeRecord::Deleted);

        let summary = ChangeSummary::from_entries(&entries);
        assert!(!summary.is_clean());
        assert_eq!(summary.total_entries(), 3);
        assert_eq!(summary.deleted, vec![LayerPath::parse("/gone").unwrap()]);
        assert_eq!(summary.bytes, 6);
    }
}
