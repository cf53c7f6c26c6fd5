//! Named image references.
//!
//! A ref maps a name such as `alpine:3.19` or `app/web:latest` to the tip of
//! a layer chain. Refs are the default roots for garbage collection. When
//! the engine is filesystem-backed they are persisted to `refs.json`, written
//! atomically through a temporary file.
//!
//! Names follow git-style rules with `:` allowed as the tag separator:
//! - Must be non-empty
//! - Must not contain whitespace, `~`, `^`, `?`, `*`, `[`, `\`
//! - Must not contain `..` or `@{`
//! - Must not start or end with `.`, `/` or `:`
//! - Must not end with `.lock`
//! - Components between slashes must be non-empty and not start with `.`

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use strata_types::Digest;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// File name of the persisted refs, next to the object directories.
pub const REFS_FILE: &str = "refs.json";

const FORMAT_VERSION: u32 = 1;

/// Characters that are forbidden anywhere in a ref name.
const FORBIDDEN_CHARS: &[char] = &[' ', '\t', '\n', '\r', '~', '^', '?', '*', '[', '\\'];

/// Validate a ref name, returning `Ok(())` if valid.
///
/// # Examples
///
/// ```
/// use strata_sdk::refs::validate_ref_name;
///
/// assert!(validate_ref_name("alpine:3.19").is_ok());
/// assert!(validate_ref_name("app/web:latest").is_ok());
/// assert!(validate_ref_name("").is_err());
/// assert!(validate_ref_name("bad..name").is_err());
/// ```
pub fn validate_ref_name(name: &str) -> EngineResult<()> {
    let invalid = |reason: String| EngineError::InvalidRefName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("ref name must not be empty".into()));
    }
    for ch in FORBIDDEN_CHARS {
        if name.contains(*ch) {
            return Err(invalid(format!("contains forbidden character: {ch:?}")));
        }
    }
    if name.contains("..") {
        return Err(invalid("must not contain '..'".into()));
    }
    if name.contains("@{") {
        return Err(invalid("must not contain '@{'".into()));
    }
    for boundary in ['.', '/', ':'] {
        if name.starts_with(boundary) || name.ends_with(boundary) {
            return Err(invalid(format!("must not start or end with {boundary:?}")));
        }
    }
    if name.ends_with(".lock") {
        return Err(invalid("must not end with '.lock'".into()));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(invalid("path components must not be empty".into()));
        }
        if component.starts_with('.') {
            return Err(invalid(format!(
                "component must not start with '.': {component:?}"
            )));
        }
    }
    Ok(())
}

/// On-disk shape of `refs.json`.
#[derive(Serialize, Deserialize)]
struct RefsFile {
    version: u32,
    /// Name to hex digest.
    refs: BTreeMap<String, String>,
}

/// Name → tip digest map, optionally persisted.
#[derive(Debug)]
pub struct RefStore {
    path: Option<PathBuf>,
    refs: RwLock<BTreeMap<String, Digest>>,
}

impl RefStore {
    /// An empty store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            refs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load `path` if it exists; every change is written back to it.
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let refs = if path.exists() {
            load(&path)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), refs = refs.len(), "opened ref store");
        Ok(Self {
            path: Some(path),
            refs: RwLock::new(refs),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<Digest> {
        self.read().get(name).copied()
    }

    /// Point `name` at `digest`, returning the previous target.
    pub fn set(&self, name: &str, digest: Digest) -> EngineResult<Option<Digest>> {
        validate_ref_name(name)?;
        let mut refs = self.write();
        let previous = refs.insert(name.to_string(), digest);
        if let Err(e) = self.persist(&refs) {
            match previous {
                Some(previous) => refs.insert(name.to_string(), previous),
                None => refs.remove(name),
            };
            return Err(e);
        }
        debug!(ref_name = name, tip = %digest.short_hex(), "set ref");
        Ok(previous)
    }

    /// Delete `name`, returning its target.
    pub fn remove(&self, name: &str) -> EngineResult<Digest> {
        let mut refs = self.write();
        let digest = refs
            .remove(name)
            .ok_or_else(|| EngineError::RefNotFound(name.to_string()))?;
        if let Err(e) = self.persist(&refs) {
            refs.insert(name.to_string(), digest);
            return Err(e);
        }
        debug!(ref_name = name, "removed ref");
        Ok(digest)
    }

    /// Every ref, sorted by name.
    pub fn list(&self) -> Vec<(String, Digest)> {
        self.read()
            .iter()
            .map(|(name, digest)| (name.clone(), *digest))
            .collect()
    }

    /// Distinct targets, for use as collection roots.
    pub fn roots(&self) -> Vec<Digest> {
        let roots: BTreeSet<Digest> = self.read().values().copied().collect();
        roots.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn persist(&self, refs: &BTreeMap<String, Digest>) -> EngineResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RefsFile {
            version: FORMAT_VERSION,
            refs: refs
                .iter()
                .map(|(name, digest)| (name.clone(), digest.to_hex()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| EngineError::CorruptRefs {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Digest>> {
        self.refs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Digest>> {
        self.refs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load(path: &Path) -> EngineResult<BTreeMap<String, Digest>> {
    let corrupt = |reason: String| EngineError::CorruptRefs {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = std::fs::read(path)?;
    let file: RefsFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    if file.version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported version {}", file.version)));
    }
    file.refs
        .into_iter()
        .map(|(name, hex)| {
            validate_ref_name(&name)?;
            let digest = Digest::from_hex(&hex).map_err(|e| corrupt(format!("{name}: {e}")))?;
            Ok((name, digest))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: u8) -> Digest {
        Digest::from_bytes(&[n])
    }

    // -----------------------------------------------------------------------
    // Names
    // -----------------------------------------------------------------------

    #[test]
    fn valid_names() {
        for name in ["main", "alpine:3.19", "app/web:latest", "user/alice/fix-123", "v1.0"] {
            assert!(validate_ref_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn invalid_names() {
        for name in [
            "",
            "has space",
            "a~b",
            "a^b",
            "a?b",
            "a*b",
            "a[b",
            "a\\b",
            "bad..name",
            "ref@{0}",
            ".hidden",
            "trailing.",
            "/leading",
            "trailing/",
            ":tag",
            "image:",
            "main.lock",
            "a//b",
            "feature/.hidden",
        ] {
            assert!(validate_ref_name(name).is_err(), "{name:?}");
        }
    }

    // -----------------------------------------------------------------------
    // Store
    // -----------------------------------------------------------------------

    #[test]
    fn set_get_remove() {
        let refs = RefStore::in_memory();
        assert_eq!(refs.set("alpine:3.19", d(1)).unwrap(), None);
        assert_eq!(refs.set("alpine:3.19", d(2)).unwrap(), Some(d(1)));
        assert_eq!(refs.get("alpine:3.19"), Some(d(2)));

        assert_eq!(refs.remove("alpine:3.19").unwrap(), d(2));
        assert!(refs.is_empty());
        assert!(matches!(
            refs.remove("alpine:3.19"),
            Err(EngineError::RefNotFound(_))
        ));
        assert!(matches!(
            refs.set("bad name", d(1)),
            Err(EngineError::InvalidRefName { .. })
        ));
    }

    #[test]
    fn roots_are_distinct() {
        let refs = RefStore::in_memory();
        refs.set("a", d(1)).unwrap();
        refs.set("b", d(1)).unwrap();
        refs.set("c", d(2)).unwrap();
        assert_eq!(refs.roots().len(), 2);
        assert_eq!(refs.list().len(), 3);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REFS_FILE);
        {
            let refs = RefStore::open(&path).unwrap();
            refs.set("app:1", d(1)).unwrap();
            refs.set("app:2", d(2)).unwrap();
            refs.remove("app:1").unwrap();
        }
        let refs = RefStore::open(&path).unwrap();
        assert_eq!(refs.list(), vec![("app:2".to_string(), d(2))]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REFS_FILE);
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            RefStore::open(&path),
            Err(EngineError::CorruptRefs { .. })
        ));

        std::fs::write(&path, br#"{"version":1,"refs":{"app":"zz"}}"#).unwrap();
        assert!(matches!(
            RefStore::open(&path),
            Err(EngineError::CorruptRefs { .. })
        ));
    }
}
