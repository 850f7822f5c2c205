//! SQLite-backed [`VectorStore`].
//!
//! Vectors are stored as little-endian `f32` BLOBs in the `embeddings`
//! table. Nearest-neighbour search loads the repository's rows and ranks
//! them by cosine distance in Rust.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use code_analyzer_core::adapters::{AdapterError, AdapterResult, VectorStore};
use code_analyzer_core::embedding::{blob_to_vec, cosine_distance, rank_nearest, vec_to_blob};
use code_analyzer_core::models::{EmbeddingRecord, RelatedDocument, RepositoryId};

pub struct SqliteVectorStore {
    pool: SqlitePool,
    model: String,
}

impl SqliteVectorStore {
    /// `model` is recorded next to each row so mixed-model corpora can be
    /// spotted when inspecting the database.
    pub fn new(pool: SqlitePool, model: impl Into<String>) -> Self {
        Self {
            pool,
            model: model.into(),
        }
    }
}

fn db_error(err: sqlx::Error) -> AdapterError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => AdapterError::transient(err.to_string()),
        sqlx::Error::Database(db) if db.message().contains("locked") => {
            AdapterError::transient(err.to_string())
        }
        _ => AdapterError::permanent(err.to_string()),
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn insert_embedding(&self, record: &EmbeddingRecord) -> AdapterResult<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (repository, key, content, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(repository, key) DO UPDATE SET
                content = excluded.content,
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(record.repository.as_str())
        .bind(&record.key)
        .bind(&record.content)
        .bind(&self.model)
        .bind(record.vector.len() as i64)
        .bind(vec_to_blob(&record.vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn count_embeddings(&self, repository: &RepositoryId) -> AdapterResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE repository = ?")
            .bind(repository.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(count.max(0) as u64)
    }

    async fn query_nearest(
        &self,
        repository: &RepositoryId,
        vector: &[f32],
        limit: usize,
    ) -> AdapterResult<Vec<RelatedDocument>> {
        let rows = sqlx::query("SELECT key, content, embedding FROM embeddings WHERE repository = ?")
            .bind(repository.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                RelatedDocument {
                    key: row.get("key"),
                    content: row.get("content"),
                    distance: cosine_distance(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank_nearest(candidates, limit))
    }
}
