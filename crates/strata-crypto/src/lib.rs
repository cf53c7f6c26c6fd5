//! Cryptographic primitives for Strata.
//!
//! Provides domain-separated BLAKE3 hashing. Every digest in the engine is
//! produced here, so identical bytes always hash identically regardless of
//! call site, while blobs and layer records can never collide.
//!
//! All crypto operations wrap established libraries; no custom cryptography.

pub mod hasher;

pub use hasher::{ContentHasher, HasherError};
