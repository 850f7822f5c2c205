//! In-memory [`VectorStore`] and [`BlobStore`].
//!
//! Vector search is brute-force cosine distance over every row of the
//! requested repository.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::adapters::{AdapterError, AdapterResult, BlobStore, VectorStore};
use crate::embedding::{cosine_distance, rank_nearest};
use crate::models::{CollectionName, EmbeddingRecord, RelatedDocument, RepositoryId};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct StoredRow {
    content: String,
    vector: Vec<f32>,
}

/// Vector store keyed by (repository, key).
#[derive(Default)]
pub struct MemoryVectorStore {
    rows: RwLock<HashMap<RepositoryId, BTreeMap<String, StoredRow>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys stored for `repository`, sorted.
    pub fn keys(&self, repository: &RepositoryId) -> Vec<String> {
        read(&self.rows)
            .get(repository)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn insert_embedding(&self, record: &EmbeddingRecord) -> AdapterResult<()> {
        write(&self.rows)
            .entry(record.repository.clone())
            .or_default()
            .insert(
                record.key.clone(),
                StoredRow {
                    content: record.content.clone(),
                    vector: record.vector.clone(),
                },
            );
        Ok(())
    }

    async fn count_embeddings(&self, repository: &RepositoryId) -> AdapterResult<u64> {
        Ok(read(&self.rows)
            .get(repository)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn query_nearest(
        &self,
        repository: &RepositoryId,
        vector: &[f32],
        limit: usize,
    ) -> AdapterResult<Vec<RelatedDocument>> {
        let rows = read(&self.rows);
        let candidates = rows
            .get(repository)
            .map(|rows| {
                rows.iter()
                    .map(|(key, row)| RelatedDocument {
                        key: key.clone(),
                        content: row.content.clone(),
                        distance: cosine_distance(vector, &row.vector),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rank_nearest(candidates, limit))
    }
}

/// Blob store holding every collection in a map.
#[derive(Default)]
pub struct MemoryBlobStore {
    collections: RwLock<HashMap<CollectionName, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_collection(&self, collection: &CollectionName) -> bool {
        read(&self.collections).contains_key(collection)
    }

    /// Number of collections currently held.
    pub fn collection_count(&self) -> usize {
        read(&self.collections).len()
    }
}

fn missing_collection(collection: &CollectionName) -> AdapterError {
    AdapterError::permanent(format!("collection not found: {}", collection))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        write(&self.collections)
            .entry(collection.clone())
            .or_default();
        Ok(())
    }

    async fn delete_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        let mut collections = write(&self.collections);
        match collections.get(collection) {
            None => Ok(()),
            Some(objects) if !objects.is_empty() => Err(AdapterError::permanent(format!(
                "collection not empty: {} ({} objects)",
                collection,
                objects.len()
            ))),
            Some(_) => {
                collections.remove(collection);
                Ok(())
            }
        }
    }

    async fn put_object(
        &self,
        collection: &CollectionName,
        key: &str,
        bytes: Vec<u8>,
    ) -> AdapterResult<()> {
        let mut collections = write(&self.collections);
        let objects = collections
            .get_mut(collection)
            .ok_or_else(|| missing_collection(collection))?;
        objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<Vec<u8>> {
        let collections = read(&self.collections);
        let objects = collections
            .get(collection)
            .ok_or_else(|| missing_collection(collection))?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| AdapterError::permanent(format!("object not found: {}/{}", collection, key)))
    }

    async fn delete_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<()> {
        if let Some(objects) = write(&self.collections).get_mut(collection) {
            objects.remove(key);
        }
        Ok(())
    }
}
