//! Adapter traits driven by the pipeline orchestrator.
//!
//! Every external system the orchestrator touches (repository snapshots,
//! blob storage, embedding and completion models, the vector store) sits
//! behind one of these traits. The orchestrator never sees a concrete
//! client; it only sees [`AdapterError`]s classified by [`ErrorKind`], which
//! decide whether a failure is retried, skipped, or fatal.
//!
//! All traits are `Send + Sync` and use `async-trait` so implementations
//! can be shared across the fan-out worker pool behind an `Arc`.
//!
//! | Trait | Role |
//! |-------|------|
//! | [`SnapshotSource`] | Export a repository into a collection, return its keys |
//! | [`BlobStore`] | Collections and objects (S3, filesystem, memory) |
//! | [`Embedder`] | Text to vector |
//! | [`ChatCompleter`] | Conversation to generated text |
//! | [`VectorStore`] | Embedding rows, counts, nearest-neighbour queries |

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{ChatMessage, CollectionName, EmbeddingRecord, RelatedDocument, RepositoryId};

/// How an adapter failure should be treated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network hiccup, rate limit, 5xx. Worth retrying.
    Transient,
    /// Bad request, missing object, auth failure.
    Permanent,
    /// The input exceeds what the embedding model accepts.
    TooLong,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::TooLong => "too long",
        };
        f.write_str(s)
    }
}

/// A classified failure reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn too_long(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooLong, message)
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Exports a repository into a blob collection.
///
/// Implementations clone or otherwise snapshot the repository, drop files
/// rejected by [`crate::filter::should_ingest`], upload every surviving file
/// into `collection` under its relative path, and return the uploaded keys.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(
        &self,
        repository: &RepositoryId,
        collection: &CollectionName,
    ) -> AdapterResult<Vec<String>>;
}

/// Collection-scoped object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create a collection. Creating an existing collection succeeds.
    async fn create_collection(&self, collection: &CollectionName) -> AdapterResult<()>;

    async fn delete_collection(&self, collection: &CollectionName) -> AdapterResult<()>;

    async fn put_object(
        &self,
        collection: &CollectionName,
        key: &str,
        bytes: Vec<u8>,
    ) -> AdapterResult<()>;

    async fn get_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<Vec<u8>>;

    async fn delete_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<()>;
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-ada-002"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed one text. Inputs the model cannot accept fail with
    /// [`ErrorKind::TooLong`].
    async fn embed(&self, text: &str) -> AdapterResult<Vec<f32>>;
}

/// Generates a reply to an ordered conversation.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    fn model_name(&self) -> &str;

    /// Returns the first generated message.
    async fn complete(&self, conversation: &[ChatMessage]) -> AdapterResult<String>;
}

/// Persistent store of embedding rows, scoped by repository.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the row for (`record.repository`, `record.key`).
    async fn insert_embedding(&self, record: &EmbeddingRecord) -> AdapterResult<()>;

    async fn count_embeddings(&self, repository: &RepositoryId) -> AdapterResult<u64>;

    /// The `limit` rows of `repository` closest to `vector`, closest first.
    async fn query_nearest(
        &self,
        repository: &RepositoryId,
        vector: &[f32],
        limit: usize,
    ) -> AdapterResult<Vec<RelatedDocument>>;
}
