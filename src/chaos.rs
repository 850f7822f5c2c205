//! Fault injection.
//!
//! A [`ChaosMonkey`] decides whether a named fault (`"github"`, `"aws"`) is
//! active. Faults come from two places:
//!
//! - `chaos.faults` in the config: always active.
//! - `chaos.server_url`: polled with `GET <server_url>?key=<fault>` before
//!   each guarded call. Any response other than `200 OK`, or no response at
//!   all, means the fault is active. [`crate::chaos_server`] is the server.
//!
//! An active fault surfaces as a `Transient` [`AdapterError`], so injected
//! failures travel the same retry and failure paths as real outages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use code_analyzer_core::adapters::{AdapterError, AdapterResult, BlobStore};
use code_analyzer_core::models::CollectionName;

use crate::config::ChaosConfig;

/// Fault checked before git operations.
pub const GIT_FAULT: &str = "github";
/// Fault checked before blob store operations.
pub const BLOB_FAULT: &str = "aws";

pub struct ChaosMonkey {
    faults: HashSet<String>,
    server_url: Option<String>,
    client: reqwest::Client,
}

impl ChaosMonkey {
    pub fn new(config: &ChaosConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            faults: config.faults.iter().cloned().collect(),
            server_url: config.server_url.clone(),
            client,
        }
    }

    /// A monkey that never injects anything.
    pub fn disabled() -> Self {
        Self::new(&ChaosConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        !self.faults.is_empty() || self.server_url.is_some()
    }

    /// Fail with a transient error if `fault` is active.
    pub async fn check(&self, fault: &str) -> AdapterResult<()> {
        if self.faults.contains(fault) {
            tracing::warn!(fault, "injected fault (static)");
            return Err(AdapterError::transient(format!("chaos: fault '{}' is active", fault)));
        }

        let Some(ref server_url) = self.server_url else {
            return Ok(());
        };
        let active = match self
            .client
            .get(server_url)
            .query(&[("key", fault)])
            .send()
            .await
        {
            Ok(resp) => resp.status() != reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!(fault, error = %e, "chaos server unreachable");
                true
            }
        };
        if active {
            tracing::warn!(fault, "injected fault (server)");
            return Err(AdapterError::transient(format!("chaos: fault '{}' is active", fault)));
        }
        Ok(())
    }
}

/// [`BlobStore`] decorator that consults a [`ChaosMonkey`] before every call.
pub struct ChaosBlobStore {
    inner: Arc<dyn BlobStore>,
    chaos: Arc<ChaosMonkey>,
}

impl ChaosBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, chaos: Arc<ChaosMonkey>) -> Self {
        Self { inner, chaos }
    }
}

#[async_trait]
impl BlobStore for ChaosBlobStore {
    async fn create_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        self.chaos.check(BLOB_FAULT).await?;
        self.inner.create_collection(collection).await
    }

    async fn delete_collection(&self, collection: &CollectionName) -> AdapterResult<()> {
        self.chaos.check(BLOB_FAULT).await?;
        self.inner.delete_collection(collection).await
    }

    async fn put_object(
        &self,
        collection: &CollectionName,
        key: &str,
        bytes: Vec<u8>,
    ) -> AdapterResult<()> {
        self.chaos.check(BLOB_FAULT).await?;
        self.inner.put_object(collection, key, bytes).await
    }

    async fn get_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<Vec<u8>> {
        self.chaos.check(BLOB_FAULT).await?;
        self.inner.get_object(collection, key).await
    }

    async fn delete_object(&self, collection: &CollectionName, key: &str) -> AdapterResult<()> {
        self.chaos.check(BLOB_FAULT).await?;
        self.inner.delete_object(collection, key).await
    }
}
