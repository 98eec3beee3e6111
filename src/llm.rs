//! Language-model backends for answer generation.
//!
//! A [`LanguageModel`] takes one prompt and returns raw text; parsing and
//! fallback handling live in the generator. Backends:
//! - **[`OpenAICompatibleModel`]**: `POST {base_url}/chat/completions` (OpenAI, Groq, vLLM, LM Studio).
//! - **[`OllamaModel`]**: `POST {base_url}/api/generate` with `stream: false`.
//! - **[`DisabledModel`]**: always fails, so answers fall back to retrieved passages.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use tenant_rag_core::error::BackendError;

use crate::config::LlmConfig;
use crate::retry::{status_error, transport_error};

pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    /// Complete `prompt`, returning the model's raw text.
    fn complete(&self, prompt: &str) -> Result<String, BackendError>;
}

pub struct DisabledModel;

impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }
    fn complete(&self, _prompt: &str) -> Result<String, BackendError> {
        Err(BackendError::Disabled("llm".to_string()))
    }
}

pub struct OpenAICompatibleModel {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl OpenAICompatibleModel {
    /// Reads the API key from `config.api_key_env`. Local endpoints
    /// (localhost, 127.0.0.1) get a dummy bearer token when it is unset.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for openai provider"))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) => key,
            Err(_) if is_local => {
                tracing::debug!("no API key set for local LLM endpoint; using dummy bearer token");
                "local".to_string()
            }
            Err(_) => bail!("{} environment variable not set", config.api_key_env),
        };
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
            client,
        })
    }
}

impl LanguageModel for OpenAICompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });
        tracing::debug!(url = %url, model = %self.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| transport_error("llm", &e, self.timeout))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| transport_error("llm", &e, self.timeout))?;
        if !status.is_success() {
            return Err(status_error("llm", status, &text));
        }
        let json: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::malformed("llm", format!("invalid JSON: {}", e)))?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &Value) -> Result<String, BackendError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| BackendError::malformed("llm", "no choices in response"))
}

pub struct OllamaModel {
    model: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for ollama provider"))?;
        let url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
            client,
        })
    }
}

impl LanguageModel for OllamaModel {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .map_err(|e| transport_error("ollama", &e, self.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(status_error("ollama", status, &text));
        }
        let json: Value = response
            .json()
            .map_err(|e| transport_error("ollama", &e, self.timeout))?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| BackendError::malformed("ollama", "missing response field"))
    }
}

/// Create the configured [`LanguageModel`].
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAICompatibleModel::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
