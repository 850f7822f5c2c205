//! OpenAI chat completions client.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use code_analyzer_core::adapters::{AdapterError, AdapterResult, ChatCompleter};
use code_analyzer_core::models::ChatMessage;

use crate::config::CompletionConfig;
use crate::embedding::{endpoint, request_error, status_error};

/// [`ChatCompleter`] backed by `POST {base_url}/chat/completions`.
pub struct OpenAiCompleter {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
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
            url: endpoint(&config.base_url, "chat/completions"),
            api_key,
            model: config.model.clone(),
        })
    }
}

fn parse_completion(json: &serde_json::Value) -> AdapterResult<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| AdapterError::permanent("Invalid OpenAI response: no choices returned"))
}

#[async_trait]
impl ChatCompleter for OpenAiCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, conversation: &[ChatMessage]) -> AdapterResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": conversation,
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

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AdapterError::permanent(format!("Invalid OpenAI response: {}", e)))?;
        parse_completion(&json)
    }
}
