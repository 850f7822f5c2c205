//! Git snapshot source.
//!
//! Workflow for one snapshot:
//!
//! 1. Clone the repository (shallow if configured) into
//!    `<work_dir>/<collection>`.
//! 2. Walk the checkout, dropping hidden paths, config files, images and
//!    any `snapshot.exclude_globs` match.
//! 3. Upload every surviving file to the collection, keyed by its
//!    `/`-separated relative path.
//! 4. Remove the checkout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::process::Command;
use walkdir::WalkDir;

use code_analyzer_core::adapters::{AdapterError, AdapterResult, BlobStore, SnapshotSource};
use code_analyzer_core::filter;
use code_analyzer_core::models::{CollectionName, RepositoryId};

use crate::chaos::{ChaosMonkey, GIT_FAULT};
use crate::config::SnapshotConfig;

pub struct GitSnapshot {
    blobs: Arc<dyn BlobStore>,
    chaos: Arc<ChaosMonkey>,
    work_dir: PathBuf,
    shallow: bool,
    branch: Option<String>,
    excludes: GlobSet,
}

impl GitSnapshot {
    pub fn new(
        config: &SnapshotConfig,
        blobs: Arc<dyn BlobStore>,
        chaos: Arc<ChaosMonkey>,
    ) -> Result<Self> {
        Ok(Self {
            blobs,
            chaos,
            work_dir: config.work_dir.clone(),
            shallow: config.shallow,
            branch: config.branch.clone(),
            excludes: build_globset(&config.exclude_globs)?,
        })
    }

    async fn clone_into(&self, url: &str, dest: &Path) -> AdapterResult<()> {
        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if let Some(ref branch) = self.branch {
            cmd.args(["--branch", branch, "--single-branch"]);
        }
        if self.shallow {
            cmd.args(["--depth", "1"]);
        }
        cmd.arg(url).arg(dest);

        let output = cmd.output().await.map_err(|e| {
            AdapterError::permanent(format!("Failed to execute 'git clone'. Is git installed? {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("git clone failed: {}", stderr.trim());
            // Network failures are transient
            if stderr.contains("Could not resolve host")
                || stderr.contains("Connection timed out")
                || stderr.contains("early EOF")
            {
                return Err(AdapterError::transient(message));
            }
            return Err(AdapterError::permanent(message));
        }
        Ok(())
    }

    async fn upload(
        &self,
        checkout: &Path,
        collection: &CollectionName,
    ) -> AdapterResult<Vec<String>> {
        let root = checkout.to_path_buf();
        let excludes = self.excludes.clone();
        let files = tokio::task::spawn_blocking(move || collect_files(&root, &excludes))
            .await
            .map_err(|e| AdapterError::permanent(format!("walk task failed: {}", e)))??;

        let mut keys = Vec::with_capacity(files.len());
        for (key, path) in files {
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                AdapterError::permanent(format!("read {}: {}", path.display(), e))
            })?;
            self.blobs.put_object(collection, &key, bytes).await?;
            keys.push(key);
        }
        Ok(keys)
    }
}

/// Files under `root` worth snapshotting, as sorted (key, path) pairs.
fn collect_files(root: &Path, excludes: &GlobSet) -> AdapterResult<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry
            .map_err(|e| AdapterError::permanent(format!("walk {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if !filter::should_ingest(&key) || excludes.is_match(&key) {
            continue;
        }
        files.push((key, path.to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[async_trait]
impl SnapshotSource for GitSnapshot {
    async fn snapshot(
        &self,
        repository: &RepositoryId,
        collection: &CollectionName,
    ) -> AdapterResult<Vec<String>> {
        self.chaos.check(GIT_FAULT).await?;

        let checkout = self.work_dir.join(collection.as_str());
        remove_checkout(&checkout).await;
        tokio::fs::create_dir_all(&self.work_dir).await.map_err(|e| {
            AdapterError::permanent(format!("create {}: {}", self.work_dir.display(), e))
        })?;

        tracing::info!(repository = %repository, checkout = %checkout.display(), "cloning");
        let result = match self.clone_into(repository.as_str(), &checkout).await {
            Ok(()) => self.upload(&checkout, collection).await,
            Err(e) => Err(e),
        };

        remove_checkout(&checkout).await;

        let keys = result?;
        tracing::info!(repository = %repository, files = keys.len(), "snapshot uploaded");
        Ok(keys)
    }
}

/// Remove a checkout directory. A missing directory is fine; any other
/// failure is logged.
async fn remove_checkout(checkout: &Path) -> bool {
    match tokio::fs::remove_dir_all(checkout).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(checkout = %checkout.display(), error = %e, "failed to remove checkout");
            false
        }
    }
}
