//! Change records: what one layer says about one path.
//!
//! A layer never stores a full tree. It stores, per path, whether the path was
//! added, modified or deleted relative to everything below it. A
//! [`ChangeRecord::Deleted`] record is a whiteout: it masks the path and
//! everything beneath it in all lower layers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use strata_types::Digest;

/// The type of a filesystem entry, with git-style octal mode bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    /// Regular file (100644).
    Regular,
    /// Executable file (100755).
    Executable,
    /// Symbolic link; the content blob holds the target (120000).
    Symlink,
    /// Directory (040000).
    Directory,
}

impl EntryMode {
    /// Git-style octal mode bits.
    pub fn bits(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Directory => 0o040000,
        }
    }

    /// Parse git-style octal mode bits.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0o100644 => Some(Self::Regular),
            0o100755 => Some(Self::Executable),
            0o120000 => Some(Self::Symlink),
            0o040000 => Some(Self::Directory),
            _ => None,
        }
    }

    /// Returns `true` for [`EntryMode::Directory`].
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl fmt::Display for EntryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", self.bits())
    }
}

/// Metadata of a live entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMeta {
    /// Content blob. The null digest for directories.
    pub content: Digest,
    /// Content size in bytes; zero for directories.
    pub size: u64,
    pub mode: EntryMode,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: u64,
}

impl FileMeta {
    /// A regular file whose bytes are stored under `content`.
    pub fn file(content: Digest, size: u64) -> Self {
        Self {
            content,
            size,
            mode: EntryMode::Regular,
            mtime: now_secs(),
        }
    }

    /// A directory. Directories own no blob.
    pub fn directory() -> Self {
        Self {
            content: Digest::null(),
            size: 0,
            mode: EntryMode::Directory,
            mtime: now_secs(),
        }
    }

    pub fn with_mode(mut self, mode: EntryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    /// The content blob this entry holds a reference to, if any.
    pub fn content_ref(&self) -> Option<Digest> {
        if self.is_dir() || self.content.is_null() {
            None
        } else {
            Some(self.content)
        }
    }
}

/// One layer's statement about one path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "meta", rename_all = "snake_case")]
pub enum ChangeRecord {
    /// The path did not exist below this layer.
    Added(FileMeta),
    /// The path existed below and this layer replaces it.
    Modified(FileMeta),
    /// Whiteout.
    Deleted,
}

impl ChangeRecord {
    /// Metadata of a live record; `None` for a whiteout.
    pub fn meta(&self) -> Option<&FileMeta> {
        match self {
            Self::Added(meta) | Self::Modified(meta) => Some(meta),
            Self::Deleted => None,
        }
    }

    pub fn is_whiteout(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Returns `true` for a live directory record.
    pub fn is_dir(&self) -> bool {
        self.meta().is_some_and(FileMeta::is_dir)
    }

    /// The content blob this record holds a reference to, if any.
    pub fn content_ref(&self) -> Option<Digest> {
        self.meta().and_then(FileMeta::content_ref)
    }

    /// Short label used in listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Modified(_) => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.meta() {
            Some(meta) => write!(
                f,
                "{} {} {} ({} bytes)",
                self.label(),
                meta.mode,
                meta.content.short_hex(),
                meta.size
            ),
            None => f.write_str(self.label()),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
