//! Immutable layers and the layer registry for Strata.
//!
//! A layer is an ordered set of change records relative to an optional
//! parent layer. Layers are content-addressed, persisted in the content store
//! and form a forest: many images can share a base layer.
//!
//! # Key Types
//!
//! - [`ChangeRecord`] -- `Added`, `Modified` or `Deleted` (whiteout) for one path
//! - [`Layer`] -- an immutable, content-addressed change set
//! - [`LayerChain`] -- ordered layer digests, base first
//! - [`LayerRegistry`] -- arena of registered layers with a child index
//! - [`ChainLease`] -- keeps every layer of a chain alive while held
//! - [`CollectionGuard`] -- exclusive registry access for the garbage collector

pub mod error;
pub mod layer;
pub mod record;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use layer::{descendants_of, Entries, Layer, LayerChain};
pub use record::{ChangeRecord, EntryMode, FileMeta};
pub use registry::{ChainLease, CollectionGuard, LayerBuilder, LayerRegistry};
