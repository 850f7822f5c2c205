//! OpenAI embeddings client.
//!
//! [`OpenAiEmbedder`] implements [`Embedder`] against `POST {base_url}/embeddings`.
//! It makes exactly one HTTP request per call; retries belong to the
//! orchestrator, which decides from the returned [`ErrorKind`]:
//!
//! - HTTP 429 and 5xx, timeouts, connection errors → `Transient`
//! - `context_length_exceeded` or "maximum context length" → `TooLong`
//! - Any other 4xx, or a malformed body → `Permanent`

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use code_analyzer_core::adapters::{AdapterError, AdapterResult, Embedder, ErrorKind};

use crate::config::EmbeddingConfig;

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    /// Build the client, reading the API key from `config.api_key_env`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        if api_key.trim().is_empty() {
            bail!("{} environment variable is empty", config.api_key_env);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: endpoint(&config.base_url, "embeddings"),
            api_key,
            model: config.model.clone(),
            dims: config.dims,
        })
    }
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

/// Classify a transport-level failure.
pub(crate) fn request_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AdapterError::transient(format!("request failed: {}", err))
    } else {
        AdapterError::permanent(format!("request failed: {}", err))
    }
}

/// Classify a non-success OpenAI response from its status and body.
pub(crate) fn status_error(status: u16, body: &str) -> AdapterError {
    let message = format!("OpenAI API error {}: {}", status, body);
    if body.contains("context_length_exceeded") || body.contains("maximum context length") {
        return AdapterError::too_long(message);
    }
    if status == 429 || (500..600).contains(&status) {
        AdapterError::transient(message)
    } else {
        AdapterError::permanent(message)
    }
}

/// Extract `data[0].embedding` from an embeddings response.
fn parse_embedding(json: &serde_json::Value) -> AdapterResult<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| AdapterError::permanent("Invalid OpenAI response: missing data[0].embedding"))?;

    embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| AdapterError::permanent("Invalid OpenAI response: non-numeric embedding"))
        })
        .collect()
}

/// Reject a non-empty vector whose length is not the configured `dims`.
pub(crate) fn check_dims(model: &str, vector: &[f32], dims: usize) -> AdapterResult<()> {
    if vector.is_empty() || vector.len() == dims {
        return Ok(());
    }
    Err(AdapterError::permanent(format!(
        "{} returned a {}-dimensional vector, expected {}",
        model,
        vector.len(),
        dims
    )))
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> AdapterResult<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body_text));
        }

        let json: serde_json::Value = response.json().await.map_err(|e| {
            AdapterError::new(ErrorKind::Permanent, format!("Invalid OpenAI response: {}", e))
        })?;
        let vector = parse_embedding(&json)?;
        check_dims(&self.model, &vector, self.dims)?;
        Ok(vector)
    }
}
