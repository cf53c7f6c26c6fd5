//! Importing a host directory as a layer.
//!
//! Whiteouts use the OCI layer convention: a file named `.wh.<name>` deletes
//! `<name>` from lower layers, and a `.wh..wh..opq` file makes its directory
//! opaque.

use std::fs;
use std::path::Path;

use serde::Serialize;
use strata_layer::{EntryMode, LayerRegistry};
use strata_types::{Digest, LayerPath};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{EngineError, EngineResult};

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// What an import recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub files: usize,
    pub dirs: usize,
    pub symlinks: usize,
    pub whiteouts: usize,
    pub bytes: u64,
}

/// Register the contents of `dir` as a layer on top of `parent`.
pub fn import_dir(
    registry: &LayerRegistry,
    parent: Option<Digest>,
    dir: &Path,
) -> EngineResult<(Digest, ImportStats)> {
    if !fs::metadata(dir)?.is_dir() {
        return Err(import_error(dir, "not a directory"));
    }

    let mut builder = registry.builder(parent);
    let mut stats = ImportStats::default();

    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| import_error(dir, e))?;
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| import_error(entry.path(), e))?;
        let path = layer_path(entry.path(), rel)?;
        let name = entry.file_name().to_string_lossy();
        let file_type = entry.file_type();

        if name == OPAQUE_MARKER {
            let opaque = path.parent().unwrap_or_else(LayerPath::root);
            if !opaque.is_root() {
                builder.whiteout(opaque.as_str())?;
                stats.whiteouts += 1;
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            let hidden = path.parent().unwrap_or_else(LayerPath::root).join(hidden)?;
            builder.whiteout(hidden.as_str())?;
            stats.whiteouts += 1;
            continue;
        }

        if file_type.is_dir() {
            builder.dir(path.as_str())?;
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let target = target
                .to_str()
                .ok_or_else(|| import_error(entry.path(), "link target is not valid UTF-8"))?;
            builder.symlink(path.as_str(), target)?;
            stats.symlinks += 1;
        } else if file_type.is_file() {
            let bytes = fs::read(entry.path())?;
            let mode = if is_executable(entry.path())? {
                EntryMode::Executable
            } else {
                EntryMode::Regular
            };
            builder.file_with_mode(path.as_str(), &bytes, mode)?;
            stats.files += 1;
            stats.bytes += bytes.len() as u64;
        } else {
            warn!(path = %entry.path().display(), "skipping special file");
        }
    }

    let digest = builder.build()?;
    info!(
        layer = %digest.short_hex(),
        source = %dir.display(),
        files = stats.files,
        whiteouts = stats.whiteouts,
        bytes = stats.bytes,
        "imported directory"
    );
    Ok((digest, stats))
}

fn layer_path(full: &Path, rel: &Path) -> EngineResult<LayerPath> {
    let mut out = String::new();
    for component in rel.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| import_error(full, "path is not valid UTF-8"))?;
        out.push('/');
        out.push_str(part);
    }
    Ok(LayerPath::parse(&out)?)
}

fn import_error(path: &Path, reason: impl std::fmt::Display) -> EngineError {
    EngineError::Import {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> std::io::Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use strata_merge::MergeView;
    use strata_store::ContentStore;

    fn registry() -> LayerRegistry {
        LayerRegistry::new(Arc::new(ContentStore::in_memory()))
    }

    fn p(path: &str) -> LayerPath {
        LayerPath::parse(path).unwrap()
    }

    #[test]
    fn imports_files_and_directories() {
        let registry = registry();
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("app/lib")).unwrap();
        fs::create_dir_all(src.path().join("var/empty")).unwrap();
        fs::write(src.path().join("app/bin"), b"v1").unwrap();
        fs::write(src.path().join("app/lib/libc.so"), b"elf").unwrap();

        let (digest, stats) = import_dir(&registry, None, src.path()).unwrap();

        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 4);
        assert_eq!(stats.bytes, 5);
        let chain = registry.resolve_chain(&digest).unwrap();
        let view = MergeView::new(&registry, &chain, None).unwrap();
        assert_eq!(view.read(&registry, &p("/app/bin")).unwrap(), b"v1");
        assert!(view.resolve_path(&p("/var/empty")).unwrap().is_dir());
    }

    #[test]
    fn whiteout_files_become_records() {
        let registry = registry();
        let mut base = registry.builder(None);
        base.file("/etc/hosts", b"h").unwrap();
        base.file("/cache/a", b"a").unwrap();
        base.file("/cache/b", b"b").unwrap();
        let base = base.build().unwrap();

        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("etc")).unwrap();
        fs::create_dir_all(src.path().join("cache")).unwrap();
        fs::write(src.path().join("etc/.wh.hosts"), b"").unwrap();
        fs::write(src.path().join("cache/.wh..wh..opq"), b"").unwrap();
        fs::write(src.path().join("cache/fresh"), b"new").unwrap();

        let (top, stats) = import_dir(&registry, Some(base), src.path()).unwrap();
        assert_eq!(stats.whiteouts, 2);

        let chain = registry.resolve_chain(&top).unwrap();
        let view = MergeView::new(&registry, &chain, None).unwrap();
        assert!(!view.lookup(&p("/etc/hosts")).is_found());
        assert_eq!(
            view.list_dir(&p("/cache")).unwrap().into_iter().collect::<Vec<_>>(),
            vec!["fresh"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn keeps_modes_and_symlinks() {
        use std::os::unix::fs::PermissionsExt;

        let registry = registry();
        let src = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("run.sh", src.path().join("start")).unwrap();

        let (digest, stats) = import_dir(&registry, None, src.path()).unwrap();
        assert_eq!(stats.symlinks, 1);

        let layer = registry.get(&digest).unwrap();
        let script = layer.record("/run.sh").unwrap().meta().unwrap();
        assert_eq!(script.mode, EntryMode::Executable);
        let link = layer.record("/start").unwrap().meta().unwrap();
        assert_eq!(link.mode, EntryMode::Symlink);
    }

    #[test]
    fn rejects_a_file_source() {
        let registry = registry();
        let src = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            import_dir(&registry, None, src.path()),
            Err(EngineError::Import { .. })
        ));
    }
}
