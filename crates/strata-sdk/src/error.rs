use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid ref name {name:?}: {reason}")]
    InvalidRefName { name: String, reason: String },

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("no layer or ref named {0}")]
    UnknownTarget(String),

    #[error("{prefix} matches {count} layers")]
    AmbiguousTarget { prefix: String, count: usize },

    #[error("corrupt refs file {path}: {reason}")]
    CorruptRefs { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot import {path}: {reason}")]
    Import { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(#[from] strata_types::TypeError),

    #[error("store error: {0}")]
    Store(#[from] strata_store::StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] strata_layer::RegistryError),

    #[error("merge error: {0}")]
    Merge(#[from] strata_merge::MergeError),

    #[error("writable layer error: {0}")]
    Writable(#[from] strata_writable::WritableError),

    #[error("collection error: {0}")]
    Gc(#[from] strata_gc::GcError),
}

pub type EngineResult<T> = Result<T, EngineError>;
