use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_resume_grace_secs")]
    pub resume_grace_secs: u64,
    #[serde(default)]
    pub embed_retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: None,
            resume_grace_secs: default_resume_grace_secs(),
            embed_retry: RetryConfig::default(),
        }
    }
}

fn default_concurrency() -> usize {
    16
}
fn default_resume_grace_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_attempts: default_max_attempts(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_attempts: self.max_attempts,
            multiplier: self.multiplier,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

fn default_initial_backoff_ms() -> u64 {
    8000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_completion_model(),
            base_url: default_base_url(),
            timeout_secs: default_completion_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_completion_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_completion_timeout_secs() -> u64 {
    120
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobConfig {
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub s3: S3Config,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            root: None,
            s3: S3Config::default(),
        }
    }
}

fn default_blob_backend() -> String {
    "filesystem".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_shallow")]
    pub shallow: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            shallow: default_shallow(),
            branch: None,
            exclude_globs: Vec::new(),
        }
    }
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("code-analyzer")
}
fn default_shallow() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChaosConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub faults: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.concurrency == 0 {
        anyhow::bail!("pipeline.concurrency must be > 0");
    }
    if config.pipeline.timeout_secs == Some(0) {
        anyhow::bail!("pipeline.timeout_secs must be > 0 when set");
    }

    let retry = &config.pipeline.embed_retry;
    if retry.max_attempts == 0 {
        anyhow::bail!("pipeline.embed_retry.max_attempts must be >= 1");
    }
    if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
        anyhow::bail!("pipeline.embed_retry.multiplier must be >= 1.0");
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        anyhow::bail!("pipeline.embed_retry.max_backoff_ms must be >= initial_backoff_ms");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if config.embedding.provider != "openai" {
        anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai.",
            config.embedding.provider
        );
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.completion.provider != "openai" {
        anyhow::bail!(
            "Unknown completion provider: '{}'. Must be openai.",
            config.completion.provider
        );
    }

    match config.blob.backend.as_str() {
        "s3" => {}
        "filesystem" => {
            if config.blob.root.is_none() {
                anyhow::bail!("blob.root must be set when blob.backend is 'filesystem'");
            }
        }
        other => anyhow::bail!(
            "Unknown blob backend: '{}'. Must be s3 or filesystem.",
            other
        ),
    }

    for pattern in &config.snapshot.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("snapshot.exclude_globs: invalid pattern '{}'", pattern))?;
    }

    Ok(())
}
