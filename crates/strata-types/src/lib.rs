//! Foundation types for Strata, a layered content-addressable filesystem
//! engine.
//!
//! Every other Strata crate depends on `strata-types`.
//!
//! # Key Types
//!
//! - [`Digest`] -- Content-addressed identifier (BLAKE3 hash) for blobs and layers
//! - [`LayerPath`] -- Normalized absolute path inside a layered filesystem

pub mod digest;
pub mod error;
pub mod path;

pub use digest::Digest;
pub use error::TypeError;
pub use path::LayerPath;
