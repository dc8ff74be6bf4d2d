//! Typed failures that callers need to tell apart.
//!
//! Everything fallible in the crate returns `anyhow::Result`; these variants
//! travel inside it and can be recovered with `downcast_ref::<FinderError>()`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinderError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("image record {0} not found")]
    RecordNotFound(i64),

    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(i64),

    #[error("tag name cannot be empty")]
    EmptyTag,

    #[error("embedding store is corrupted: {0}")]
    StoreCorrupt(String),

    #[error("slot {slot} is out of range for a store of {len} slots")]
    SlotOutOfRange { slot: i64, len: usize },

    #[error("search index is not available at {0}")]
    IndexUnavailable(PathBuf),

    #[error("search index artifact is invalid: {0}")]
    IndexCorrupt(String),

    #[error("embedding model is unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    #[error("invalid perceptual hash {0:?}")]
    InvalidHash(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// True when `err` carries the given typed failure.
pub fn is_dimension_mismatch(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<FinderError>(),
        Some(FinderError::DimensionMismatch { .. })
    )
}
