//! Copy-on-write writable layers for Strata.
//!
//! Each running instance gets one [`WritableLayer`] on top of an immutable
//! chain. Its changes are invisible to every other instance until committed,
//! and committing never alters the layers below.
//!
//! # Key Types
//!
//! - [`WritableLayer`] -- the mutable change set of one instance
//! - [`OpContext`] -- deadline and cancellation for a single call
//! - [`CancelFlag`] -- shareable cancellation signal
//! - [`ChangeSummary`] -- pending changes grouped by kind

pub mod context;
pub mod error;
pub mod status;
pub mod writable;

pub use context::{CancelFlag, OpContext};
pub use error::{WritableError, WritableResult};
pub use status::ChangeSummary;
pub use writable::{Phase, WritableLayer, MAX_FILE_SIZE};
