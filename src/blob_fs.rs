//! Filesystem blob store: each collection is a directory under a root.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use code_analyzer_core::adapters::{AdapterError, AdapterResult, BlobStore};
use code_analyzer_core::models::CollectionName;

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, collection: &CollectionName) -> PathBuf {
        self.root.join(collection.as_str())
    }

    fn object_path(&self, collection: &CollectionName, key: &str) -> AdapterResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(AdapterError::permanent(format!("invalid object key: {}", key)));
        }
        Ok(self.collection_dir(collection).join(relative))
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> AdapterError {
    let message = format!("{} {}: {}", action, path.display(), err);
    match err.kind() {
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            AdapterError::transient(message)
        }
        _ => AdapterError::permanent(message),
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn create_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        let dir = self.collection_dir(collection);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, e))
    }

    async fn delete_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        let dir = self.collection_dir(collection);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &dir, e)),
        }
    }

    async fn put_object(
        &self,
        collection: &CollectionName,
        key: &str,
        bytes: Vec<u8>,
    ) -> AdapterResult<()> {
        let path = self.object_path(collection, key)?;
        if !tokio::fs::try_exists(self.collection_dir(collection))
            .await
            .unwrap_or(false)
        {
            return Err(AdapterError::permanent(format!(
                "collection not found: {}",
                collection
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create", parent, e))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| io_error("write", &path, e))
    }

    async fn get_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<Vec<u8>> {
        let path = self.object_path(collection, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error("read", &path, e))
    }

    async fn delete_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<()> {
        let path = self.object_path(collection, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}
