//! Content-addressed object storage for Strata.
//!
//! This crate implements the reference-counted store underneath every layered
//! filesystem view. File contents and serialized layer records are stored as
//! immutable objects identified by their BLAKE3 digest (domain-separated by
//! object kind), so identical bytes are stored once no matter how many layers
//! reference them.
//!
//! # Object Kinds
//!
//! - [`ObjectKind::Blob`] -- raw file content
//! - [`ObjectKind::Layer`] -- a serialized layer record (parent + change set)
//!
//! # Storage Backends
//!
//! All backends implement the [`ObjectBackend`] trait:
//!
//! - [`InMemoryBackend`] -- `HashMap`-based backend for tests and embedding
//! - [`FsBackend`] -- one file per object under a root directory
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written (content-addressing guarantees this).
//! 2. `put` is idempotent and counts a reference per call.
//! 3. Releasing the last reference never deletes; only [`ContentStore::sweep`] does.
//! 4. Backend I/O happens outside the metadata lock.
//! 5. Transient backend failures are retried locally with bounded backoff.

pub mod backend;
pub mod config;
pub mod error;
pub mod fetch;
pub mod fs;
pub mod memory;
pub mod object;
pub mod store;

// Re-export primary types at crate root for ergonomic imports.
pub use backend::ObjectBackend;
pub use config::{RetryPolicy, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use fetch::BlobFetcher;
pub use fs::FsBackend;
pub use memory::InMemoryBackend;
pub use object::{ObjectKind, StoredObject};
pub use store::{ContentStore, ObjectMeta, StoreStats, SweepReport};
