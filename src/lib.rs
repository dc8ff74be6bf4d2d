//! Semantic search over large private image collections.
//!
//! Images are catalogued in SQLite, embedded with a CLIP-style model into a
//! crash-safe npy store, and searched through a flat or IVF-PQ index.

pub mod clip;
pub mod config;
pub mod db;
pub mod duplicates;
pub mod error;
pub mod index;
pub mod logging;
pub mod pipeline;
pub mod query;
pub mod scanner;
pub mod store;
