//! Embedding backends.
//!
//! Every backend implements the core [`Embedder`] trait:
//! - **[`HashingEmbedder`]**: deterministic feature hashing; no network, the default.
//! - **[`DisabledEmbedder`]**: returns errors; ingestion and routing refuse to run.
//! - **[`OpenAIEmbedder`]**: calls an OpenAI-compatible `/embeddings` endpoint.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs models locally via fastembed; no network calls after model download.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate the appropriate backend from the
//! configuration:
//!
//! ```rust
//! # use tenant_rag::config::EmbeddingConfig;
//! # use tenant_rag::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hashing"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "hashing");
//! ```
//!
//! # Retry Strategy
//!
//! Network backends send texts in batches of `batch_size`, each batch under
//! [`with_backoff`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//!
//! Every returned vector is checked against the declared `dims`.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;

use tenant_rag_core::error::BackendError;

pub use tenant_rag_core::embedding::{cosine_similarity, Embedder, HashingEmbedder};

use crate::config::EmbeddingConfig;
use crate::retry::{status_error, transport_error, with_backoff, RetryPolicy};

/// Dimensionality of the hashing embedder when `dims` is not configured.
pub const DEFAULT_HASHING_DIMS: usize = 256;

// ============ Disabled ============

/// An embedder that always fails.
///
/// Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Err(BackendError::Disabled("embedding".to_string()))
    }
}

// ============ OpenAI ============

/// Embedder using an OpenAI-compatible API.
///
/// Calls `POST {url}/embeddings` (default `https://api.openai.com/v1`).
/// The API key is read from the environment variable named by
/// `embedding.api_key_env` at construction.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    base_url: String,
    api_key: String,
    batch_size: usize,
    timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::blocking::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            model,
            dims,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            batch_size: config.batch_size.max(1),
            timeout,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_ms),
            client,
        })
    }

    fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| transport_error("openai-embeddings", &e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(status_error("openai-embeddings", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .map_err(|e| transport_error("openai-embeddings", &e, self.timeout))?;
        parse_openai_response(&json)
    }
}

impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        embed_in_batches(self, texts, self.batch_size, |batch| {
            with_backoff(&self.retry, "openai-embeddings", || self.request(batch))
        })
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, BackendError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| BackendError::malformed("openai-embeddings", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| BackendError::malformed("openai-embeddings", "missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, json_floats(embedding)));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Embedder using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default: `http://localhost:11434`).
/// Requires Ollama to be running with an embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    batch_size: usize,
    timeout: Duration,
    retry: RetryPolicy,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            batch_size: config.batch_size.max(1),
            timeout,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_ms),
            client,
        })
    }

    fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .map_err(|e| {
                let mut err = transport_error("ollama-embeddings", &e, self.timeout);
                if let BackendError::Unavailable { message, .. } = &mut err {
                    *message = format!("is Ollama running at {}? {}", self.url, message);
                }
                err
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(status_error("ollama-embeddings", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .map_err(|e| transport_error("ollama-embeddings", &e, self.timeout))?;
        parse_ollama_response(&json)
    }
}

impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        embed_in_batches(self, texts, self.batch_size, |batch| {
            with_backoff(&self.retry, "ollama-embeddings", || self.request(batch))
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, BackendError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| BackendError::malformed("ollama-embeddings", "missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| json_floats(values))
                .ok_or_else(|| {
                    BackendError::malformed("ollama-embeddings", "embedding is not an array")
                })
        })
        .collect()
}

// ============ Local (fastembed) ============

/// Embedder for local inference with fastembed.
///
/// The model is downloaded from Hugging Face on construction and cached.
/// After that, embeddings run entirely offline. Each batch runs on a
/// helper thread bounded by `embedding.timeout_secs`.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    timeout: Duration,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, dims) = resolve_local_model(config);
        let fastembed_model = config_to_fastembed_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims,
            batch_size: config.batch_size.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        let vectors = crate::retry::run_with_timeout("local-embeddings", self.timeout, move || {
            let mut model = model
                .lock()
                .map_err(|_| BackendError::unavailable("local-embeddings", "model lock poisoned"))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| BackendError::unavailable("local-embeddings", e.to_string()))
        })?;
        check_dims(self, &vectors)?;
        Ok(vectors)
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn resolve_local_model(config: &EmbeddingConfig) -> (String, usize) {
    let model_name = config
        .model
        .clone()
        .unwrap_or_else(|| "all-minilm-l6-v2".to_string());

    let dims = config.dims.unwrap_or(match model_name.as_str() {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-base" => 768,
        "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
        _ => 384,
    });

    (model_name, dims)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

// ============ Shared helpers ============

fn json_floats(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Split `texts` into batches, embed each, and verify shape.
fn embed_in_batches(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
    mut embed: impl FnMut(&[String]) -> Result<Vec<Vec<f32>>, BackendError>,
) -> Result<Vec<Vec<f32>>, BackendError> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embed(batch)?;
        if vectors.len() != batch.len() {
            return Err(BackendError::malformed(
                embedder.model_name(),
                format!("expected {} vectors, got {}", batch.len(), vectors.len()),
            ));
        }
        check_dims(embedder, &vectors)?;
        out.extend(vectors);
    }
    Ok(out)
}

fn check_dims(embedder: &dyn Embedder, vectors: &[Vec<f32>]) -> Result<(), BackendError> {
    match vectors.iter().find(|v| v.len() != embedder.dims()) {
        Some(bad) => Err(BackendError::malformed(
            embedder.model_name(),
            format!("expected {} dimensions, got {}", embedder.dims(), bad.len()),
        )),
        None => Ok(()),
    }
}

/// Create the appropriate [`Embedder`] based on configuration.
///
/// | Config Value | Backend |
/// |-------------|----------|
/// | `"hashing"` | [`HashingEmbedder`] |
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASHING_DIMS),
        ))),
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_hashing_and_disabled() {
        let mut config = EmbeddingConfig::default();
        let e = create_embedder(&config).unwrap();
        assert_eq!(e.dims(), DEFAULT_HASHING_DIMS);

        config.provider = "disabled".into();
        let e = create_embedder(&config).unwrap();
        assert!(matches!(
            e.embed("anything"),
            Err(BackendError::Disabled(_))
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "magic".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn test_openai_response_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_malformed_responses() {
        assert!(parse_openai_response(&serde_json::json!({"error": "x"})).is_err());
        assert!(parse_ollama_response(&serde_json::json!({"embeddings": [1, 2]})).is_err());
        let ok = parse_ollama_response(&serde_json::json!({"embeddings": [[0.5, 0.5]]})).unwrap();
        assert_eq!(ok, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn test_batches_check_dimensions() {
        let e = HashingEmbedder::new(4);
        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let mut calls = 0;
        let out = embed_in_batches(&e, &texts, 2, |batch| {
            calls += 1;
            e.embed_batch(batch)
        })
        .unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(calls, 3);

        let err = embed_in_batches(&e, &texts, 2, |batch| Ok(vec![vec![0.0; 3]; batch.len()]))
            .unwrap_err();
        assert!(matches!(err, BackendError::Malformed { .. }));
    }
}
