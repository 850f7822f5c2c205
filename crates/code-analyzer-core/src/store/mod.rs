//! In-memory adapter implementations.
//!
//! [`MemoryVectorStore`] and [`MemoryBlobStore`] implement the
//! [`VectorStore`](crate::adapters::VectorStore) and
//! [`BlobStore`](crate::adapters::BlobStore) traits with plain collections
//! behind `std::sync::RwLock`. They back the pipeline tests, where nothing
//! needs to outlive the process.

pub mod memory;

pub use memory::{MemoryBlobStore, MemoryVectorStore};
