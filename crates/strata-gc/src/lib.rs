//! Garbage collection for Strata.
//!
//! Reference counts say what is still in use; the collector decides what a
//! layer's absence from every root means and hands the rest to the store's
//! sweep.
//!
//! # Key Types
//!
//! - [`GarbageCollector`] -- one-shot mark-and-release collection
//! - [`GcReport`] -- what a collection reclaimed
//! - [`PeriodicCollector`] -- background collection on a tokio interval
//! - [`GcConfig`] -- collection interval settings

pub mod collector;
pub mod error;
pub mod periodic;

pub use collector::{collect, GarbageCollector, GcConfig, GcReport};
pub use error::{GcError, GcResult};
pub use periodic::{run_once, PeriodicCollector, RootsProvider};
