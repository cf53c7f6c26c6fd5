//! High-level engine API for Strata.
//!
//! [`Engine`] is the entry point for applications embedding Strata. It owns
//! the content store, the layer registry and the named refs, and exposes the
//! operations a container runtime needs: register or import layers, resolve
//! logical views, hand out writable layers and collect garbage.
//!
//! # Key Types
//!
//! - [`Engine`] -- the facade over every subsystem
//! - [`EngineConfig`] -- TOML-loadable settings
//! - [`RefStore`] -- named image references, the default collection roots

pub mod config;
pub mod engine;
pub mod error;
pub mod import;
pub mod refs;

pub use config::{EngineConfig, StoreSettings};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, EngineResult};
pub use import::ImportStats;
pub use refs::{validate_ref_name, RefStore};

// Re-export key types
pub use strata_gc::{run_once, GarbageCollector, GcConfig, GcReport, PeriodicCollector};
pub use strata_layer::{ChangeRecord, Entries, EntryMode, FileMeta, Layer, LayerChain};
pub use strata_merge::{MaterializeStats, ResolvedEntry, Source};
pub use strata_store::{BlobFetcher, StoreStats};
pub use strata_types::{Digest, LayerPath};
pub use strata_writable::{ChangeSummary, OpContext, WritableError, WritableLayer};
