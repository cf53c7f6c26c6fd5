//! Flattening a logical view.
//!
//! [`MergeView::export`] lists every visible entry, parents before children.
//! [`materialize`] writes that listing onto the host filesystem, the way an
//! image would be unpacked into a root directory.

use std::fs;
use std::path::Path;

use serde::Serialize;
use strata_layer::{Entries, EntryMode, LayerChain, LayerRegistry};
use strata_types::LayerPath;
use tracing::debug;

use crate::error::MergeResult;
use crate::resolver::{MergeView, ResolvedEntry};

impl MergeView<'_> {
    /// Every visible path except the root, ordered by path so that each
    /// directory precedes its descendants.
    pub fn export(&self) -> MergeResult<Vec<ResolvedEntry>> {
        let mut out = Vec::new();
        let mut stack = vec![LayerPath::root()];
        while let Some(dir) = stack.pop() {
            let names = self.list_dir(&dir)?;
            let mut subdirs = Vec::new();
            for name in &names {
                let child = dir.join(name)?;
                let entry = self.resolve_path(&child)?;
                if entry.is_dir() {
                    subdirs.push(child);
                }
                out.push(entry);
            }
            stack.extend(subdirs.into_iter().rev());
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

/// Export the view of `chain` plus an optional upper change set.
pub fn export(
    registry: &LayerRegistry,
    chain: &LayerChain,
    upper: Option<&Entries>,
) -> MergeResult<Vec<ResolvedEntry>> {
    MergeView::new(registry, chain, upper)?.export()
}

/// Summary of a [`materialize`] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub bytes: u64,
}

/// Write the view into `dest`, which is created if needed.
pub fn materialize(
    view: &MergeView<'_>,
    registry: &LayerRegistry,
    dest: &Path,
) -> MergeResult<MaterializeStats> {
    fs::create_dir_all(dest)?;
    let mut stats = MaterializeStats::default();

    for entry in view.export()? {
        let target = dest.join(entry.path.as_str().trim_start_matches('/'));
        match entry.meta.mode {
            EntryMode::Directory => {
                fs::create_dir_all(&target)?;
                stats.dirs += 1;
            }
            EntryMode::Symlink => {
                let link = view.read(registry, &entry.path)?;
                write_symlink(&link, &target)?;
                stats.symlinks += 1;
            }
            EntryMode::Regular | EntryMode::Executable => {
                let bytes = view.read(registry, &entry.path)?;
                fs::write(&target, &bytes)?;
                set_executable(&target, entry.meta.mode == EntryMode::Executable)?;
                stats.files += 1;
                stats.bytes += bytes.len() as u64;
            }
        }
    }

    debug!(dest = %dest.display(), files = stats.files, dirs = stats.dirs, "materialized view");
    Ok(stats)
}

#[cfg(unix)]
fn write_symlink(link: &[u8], target: &Path) -> std::io::Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(OsStr::from_bytes(link), target)
}

#[cfg(not(unix))]
fn write_symlink(link: &[u8], target: &Path) -> std::io::Result<()> {
    fs::write(target, link)
}

#[cfg(unix)]
fn set_executable(target: &Path, executable: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_target: &Path, _executable: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_store::ContentStore;
    use strata_types::Digest;

    fn p(path: &str) -> LayerPath {
        LayerPath::parse(path).unwrap()
    }

    fn image(registry: &LayerRegistry) -> Digest {
        let mut base = registry.builder(None);
        base.file("/app/bin", b"v1").unwrap();
        base.file("/app/tmp/cache", b"junk").unwrap();
        base.file("/etc/hosts", b"127.0.0.1").unwrap();
        let base = base.build().unwrap();

        let mut top = registry.builder(Some(base));
        top.modified("/app/bin", b"v2").unwrap();
        top.whiteout("/app/tmp").unwrap();
        top.file_with_mode("/app/run.sh", b"#!/bin/sh", EntryMode::Executable)
            .unwrap();
        top.symlink("/app/current", "bin").unwrap();
        top.dir("/var/empty").unwrap();
        top.build().unwrap()
    }

    #[test]
    fn export_lists_parents_first() {
        let registry = LayerRegistry::new(Arc::new(ContentStore::in_memory()));
        let tip = image(&registry);
        let chain = registry.resolve_chain(&tip).unwrap();

        let paths: Vec<String> = export(&registry, &chain, None)
            .unwrap()
            .into_iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/app",
                "/app/bin",
                "/app/current",
                "/app/run.sh",
                "/etc",
                "/etc/hosts",
                "/var",
                "/var/empty",
            ]
        );
        for (i, path) in paths.iter().enumerate() {
            let path = p(path);
            if let Some(parent) = path.parent().filter(|p| !p.is_root()) {
                let parent_pos = paths.iter().position(|q| q == parent.as_str()).unwrap();
                assert!(parent_pos < i);
            }
        }
    }

    #[test]
    fn materialize_writes_visible_tree() {
        let registry = LayerRegistry::new(Arc::new(ContentStore::in_memory()));
        let tip = image(&registry);
        let chain = registry.resolve_chain(&tip).unwrap();
        let view = MergeView::new(&registry, &chain, None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let stats = materialize(&view, &registry, dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("app/bin")).unwrap(), b"v2");
        assert_eq!(fs::read(dir.path().join("etc/hosts")).unwrap(), b"127.0.0.1");
        assert!(!dir.path().join("app/tmp").exists());
        assert!(dir.path().join("var/empty").is_dir());
        assert_eq!(stats.files, 3);
        assert_eq!(stats.symlinks, 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("app/run.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
            let link = fs::read_link(dir.path().join("app/current")).unwrap();
            assert_eq!(link, Path::new("bin"));
        }
    }
}
