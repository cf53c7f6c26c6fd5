//! Union-mount merge resolution for Strata.
//!
//! Resolution is a pure function of a layer chain and an optional upper
//! change set: nothing here mutates a layer or the store.
//!
//! # Key Types
//!
//! - [`MergeView`] -- snapshot of a chain plus writable changes
//! - [`ResolvedEntry`] -- what a reader sees at one path, and where it came from
//! - [`Lookup`] -- found, whited out, or absent
//!
//! # Rules
//!
//! 1. Levels are consulted top to base; the first one that speaks decides.
//! 2. A whiteout masks the path and every path beneath it in lower levels.
//! 3. A non-directory record masks everything beneath it in lower levels.
//! 4. A whiteout with live records beneath it in the same level is an opaque
//!    directory.
//! 5. Directories without a record of their own are implied by their
//!    contents; the root always exists.

pub mod error;
pub mod export;
pub mod resolver;

pub use error::{MergeError, MergeResult};
pub use export::{export, materialize, MaterializeStats};
pub use resolver::{list_dir, read, resolve_path, Lookup, MergeView, ResolvedEntry, Source};
