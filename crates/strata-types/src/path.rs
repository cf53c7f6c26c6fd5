//! Normalized absolute paths inside a layered filesystem.
//!
//! A [`LayerPath`] is always absolute, has no empty, `.` or `..` components
//! and no trailing slash. Ordering paths as strings places every directory
//! before its descendants, and all descendants of `/a` form one contiguous
//! range of keys starting with `/a/`.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// A normalized absolute path such as `/app/bin`. The root is `/`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerPath(String);

impl LayerPath {
    /// The root directory.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Normalize `raw` into a `LayerPath`.
    ///
    /// Relative input is interpreted from the root, `.` and empty components
    /// are dropped and `..` is resolved lexically. A `..` that would climb
    /// above the root, or a NUL byte, is rejected.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        if raw.contains('\0') {
            return Err(TypeError::InvalidPath {
                path: raw.to_string(),
                reason: "contains NUL byte".into(),
            });
        }

        let mut components: Vec<&str> = Vec::new();
        for component in raw.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(TypeError::InvalidPath {
                            path: raw.to_string(),
                            reason: "'..' escapes the root".into(),
                        });
                    }
                }
                name => components.push(name),
            }
        }

        if components.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(format!("/{}", components.join("/"))))
    }

    /// The normalized path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for `/`.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// The containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<LayerPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append a relative path, normalizing the result.
    pub fn join(&self, relative: &str) -> Result<LayerPath, TypeError> {
        Self::parse(&format!("{}/{}", self.0, relative))
    }

    /// Path components from the root down (empty for the root).
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Proper ancestors, nearest first, excluding the root.
    ///
    /// For `/a/b/c` this yields `/a/b` then `/a`.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        let path = self.0.as_str();
        let mut end = path.len();
        std::iter::from_fn(move || {
            let idx = path[..end].rfind('/')?;
            if idx == 0 {
                return None;
            }
            end = idx;
            Some(&path[..idx])
        })
    }

    /// The prefix shared by every strict descendant (`/a/` for `/a`, `/` for
    /// the root). Useful as the lower bound of an ordered-map range scan.
    pub fn descendant_prefix(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("{}/", self.0)
        }
    }

    /// Returns `true` if `other` lies strictly beneath `self`.
    pub fn is_ancestor_of(&self, other: &LayerPath) -> bool {
        self != other && other.0.starts_with(&self.descendant_prefix())
    }

    /// If `path` lies strictly beneath `self`, the name of the direct child
    /// of `self` on the way to it. For `self = /a` and `path = /a/b/c` this is
    /// `b`.
    pub fn child_name_toward<'p>(&self, path: &'p str) -> Option<&'p str> {
        let prefix = self.descendant_prefix();
        let rest = path.strip_prefix(prefix.as_str())?;
        let name = rest.split('/').next()?;
        if name.is_empty() {
            return None;
        }
        Some(name)
    }
}

impl fmt::Debug for LayerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerPath({})", self.0)
    }
}

impl fmt::Display for LayerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LayerPath {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LayerPath {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for LayerPath {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<LayerPath> for String {
    fn from(path: LayerPath) -> Self {
        path.0
    }
}

impl AsRef<str> for LayerPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LayerPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> LayerPath {
        LayerPath::parse(s).unwrap()
    }

    #[test]
    fn normalizes_redundant_components() {
        assert_eq!(p("a//b/./c/").as_str(), "/a/b/c");
        assert_eq!(p("/a/b/../c").as_str(), "/a/c");
        assert_eq!(p("").as_str(), "/");
        assert_eq!(p("/./").as_str(), "/");
    }

    #[test]
    fn rejects_escaping_root() {
        assert!(matches!(
            LayerPath::parse("/../etc"),
            Err(TypeError::InvalidPath { .. })
        ));
        assert!(LayerPath::parse("a/../../b").is_err());
        assert!(LayerPath::parse("bad\0name").is_err());
    }

    #[test]
    fn parent_and_file_name() {
        let path = p("/app/bin/tool");
        assert_eq!(path.file_name(), Some("tool"));
        assert_eq!(path.parent().unwrap().as_str(), "/app/bin");
        assert_eq!(p("/app").parent().unwrap(), LayerPath::root());
        assert!(LayerPath::root().parent().is_none());
        assert!(LayerPath::root().file_name().is_none());
    }

    #[test]
    fn ancestors_nearest_first_without_root() {
        let path = p("/a/b/c");
        let ancestors: Vec<&str> = path.ancestors().collect();
        assert_eq!(ancestors, vec!["/a/b", "/a"]);
        assert_eq!(p("/a").ancestors().count(), 0);
        assert_eq!(LayerPath::root().ancestors().count(), 0);
    }

    #[test]
    fn join_normalizes() {
        assert_eq!(p("/app").join("conf").unwrap().as_str(), "/app/conf");
        assert_eq!(LayerPath::root().join("x/y").unwrap().as_str(), "/x/y");
        assert_eq!(p("/a/b").join("..").unwrap().as_str(), "/a");
    }

    #[test]
    fn ancestor_relation_respects_component_boundaries() {
        assert!(p("/a").is_ancestor_of(&p("/a/b")));
        assert!(!p("/a").is_ancestor_of(&p("/ab")));
        assert!(!p("/a").is_ancestor_of(&p("/a")));
        assert!(LayerPath::root().is_ancestor_of(&p("/a")));
    }

    #[test]
    fn child_name_toward_descendant() {
        assert_eq!(p("/a").child_name_toward("/a/b/c"), Some("b"));
        assert_eq!(LayerPath::root().child_name_toward("/x/y"), Some("x"));
        assert_eq!(p("/a").child_name_toward("/ab/c"), None);
        assert_eq!(p("/a").child_name_toward("/a"), None);
    }

    #[test]
    fn string_order_puts_parents_first() {
        let mut paths = vec![p("/a/b"), p("/a-b"), p("/a"), p("/")];
        paths.sort();
        assert_eq!(paths[0].as_str(), "/");
        let a = paths.iter().position(|x| x.as_str() == "/a").unwrap();
        let ab = paths.iter().position(|x| x.as_str() == "/a/b").unwrap();
        assert!(a < ab);
    }

    #[test]
    fn serde_uses_plain_string() {
        let json = serde_json::to_string(&p("/x/y")).unwrap();
        assert_eq!(json, "\"/x/y\"");
        let back: LayerPath = serde_json::from_str("\"x//y/\"").unwrap();
        assert_eq!(back.as_str(), "/x/y");
        assert!(serde_json::from_str::<LayerPath>("\"/..\"").is_err());
    }

    proptest! {
        #[test]
        fn normalization_is_idempotent(raw in "[a-c./]{0,24}") {
            if let Ok(once) = LayerPath::parse(&raw) {
                let twice = LayerPath::parse(once.as_str()).unwrap();
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn normalized_paths_have_no_dot_components(raw in "[a-c./]{0,24}") {
            if let Ok(path) = LayerPath::parse(&raw) {
                prop_assert!(path.as_str().starts_with('/'));
                prop_assert!(!path.as_str().contains("//"));
                prop_assert!(path.components().all(|c| c != "." && c != ".."));
            }
        }
    }
}
